use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;

use wavemeter_server::config::PidParams;
use wavemeter_server::controller::Controller;
use wavemeter_server::driver::{SimulatedDac, SimulatedWavemeter};
use wavemeter_server::protocol::{Frame, Value, WavemeterCodec};
use wavemeter_server::registry::Channel;
use wavemeter_server::{pid, session};

pub struct TestServer {
    pub addr: SocketAddr,
    pub wavemeter: Arc<SimulatedWavemeter>,
    pub dac: Arc<SimulatedDac>,
    shutdown: broadcast::Sender<()>,
}

impl TestServer {
    /// Connect, complete the `CON` handshake, and return the framed socket plus the `STA` reply.
    pub async fn connect(&self, name: &str) -> (Framed<TcpStream, WavemeterCodec>, Frame) {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let mut framed = Framed::new(stream, WavemeterCodec);
        framed
            .send(Frame::control("CON", vec![Value::Str(name.to_string())]))
            .await
            .unwrap();
        let sta = framed.next().await.unwrap().unwrap();
        (framed, sta)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub fn default_channel(name: &str, fiber_switch: u8, dac_channel: u32) -> Channel {
    Channel::new(name, fiber_switch, dac_channel, 300.0, 10, 1.0, 0.1, 0.01, 1.0)
}

pub async fn start_server(channels: Vec<Channel>) -> TestServer {
    let wavemeter = Arc::new(SimulatedWavemeter::new(5, 1, 10_000));
    let dac = Arc::new(SimulatedDac::new());
    let params = Arc::new(PidParams::default());

    let mut map = indexmap::IndexMap::new();
    for channel in channels {
        map.insert(channel.name.clone(), Arc::new(Mutex::new(channel)));
    }
    let channel_table = Arc::new(map);

    let (shutdown_tx, shutdown_rx_controller) = broadcast::channel(1);
    let shutdown_rx_pid = shutdown_tx.subscribe();

    let (controller, pid_handles, event_rx) = Controller::new(
        channel_table,
        wavemeter.clone(),
        dac.clone(),
        params,
        std::env::temp_dir(),
    );
    let (work_tx, work_rx) = mpsc::channel(1024);
    tokio::spawn(controller.run(work_rx, event_rx, shutdown_rx_controller));
    tokio::spawn(pid::run(pid_handles, shutdown_rx_pid));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(session::accept_loop(listener, work_tx, shutdown_tx.clone()));

    TestServer {
        addr,
        wavemeter,
        dac,
        shutdown: shutdown_tx,
    }
}
