use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::{Arc, Mutex};
use wavemeter_server::config::PidParams;
use wavemeter_server::controller::Controller;
use wavemeter_server::driver::{SimulatedDac, SimulatedWavemeter};
use wavemeter_server::pid::measure_channel;
use wavemeter_server::registry::Channel;

fn bench_channel() -> (Arc<Mutex<Channel>>, wavemeter_server::controller::ChannelTable) {
    let channel = Arc::new(Mutex::new(Channel::new(
        "Ch1", 0, 0, 300.0, 10, 1.0, 0.1, 0.01, 1.0,
    )));
    channel.lock().unwrap().monitor_list.insert("bench".to_string());
    channel.lock().unwrap().pid_on = true;
    let mut map = indexmap::IndexMap::new();
    map.insert("Ch1".to_string(), channel.clone());
    (channel, Arc::new(map))
}

pub fn measure_channel_step(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (channel, channels) = bench_channel();
    let wavemeter = Arc::new(SimulatedWavemeter::new(0, 1, 10_000));
    let dac = Arc::new(SimulatedDac::new());
    let params = Arc::new(PidParams::default());
    let (_controller, handles, _event_rx) =
        Controller::new(channels, wavemeter, dac, params, std::env::temp_dir());

    c.bench_function("pid measurement step", |b| {
        b.to_async(&rt)
            .iter(|| async { measure_channel("Ch1", &channel, &handles).await });
    });
}

criterion_group!(benches, measure_channel_step);
criterion_main!(benches);
