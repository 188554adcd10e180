pub use clap::Parser;
use eyre::Context;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::{broadcast, mpsc},
};
use tracing::info;
use wavemeter_server::{
    args,
    config::{self, PidParams},
    controller::Controller,
    driver::{DacDriver, SimulatedDac, SimulatedWavemeter, WavemeterDriver},
    monitoring, pid, session, telemetry,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    telemetry::init_tracing_subscriber();
    let cli = args::Cli::parse();

    if !cli.skip_hardware {
        info!("real hardware support is outside this server's scope, running against the simulated driver");
    }

    let startup = config::load_startup_config(&cli.config_path)
        .wrap_err_with(|| format!("loading {}", cli.config_path.display()))?;
    let params: Arc<PidParams> = Arc::new(startup.params);

    let mut channel_map = indexmap::IndexMap::new();
    for channel in startup.channels {
        channel_map.insert(channel.name.clone(), Arc::new(std::sync::Mutex::new(channel)));
    }
    let channels = Arc::new(channel_map);

    let wavemeter: Arc<dyn WavemeterDriver> = Arc::new(SimulatedWavemeter::new(50, 1, 10_000));
    let dac: Arc<dyn DacDriver> = Arc::new(SimulatedDac::new());

    let (shutdown_tx, shutdown_rx_controller) = broadcast::channel(1);
    let shutdown_rx_pid = shutdown_tx.subscribe();

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let mut term = signal(SignalKind::terminate()).unwrap();
            let mut quit = signal(SignalKind::quit()).unwrap();
            let mut int = signal(SignalKind::interrupt()).unwrap();
            tokio::select! {
                _ = term.recv() => (),
                _ = quit.recv() => (),
                _ = int.recv() => (),
            }
            info!("Shutting down!");
            let _ = shutdown_tx.send(());
        }
    });

    let (controller, pid_handles, event_rx) =
        Controller::new(channels, wavemeter, dac, params, cli.snapshot_dir.clone());

    let (work_tx, work_rx) = mpsc::channel(1024);

    let controller_task = tokio::spawn(controller.run(work_rx, event_rx, shutdown_rx_controller));
    let pid_task = tokio::spawn(pid::run(pid_handles, shutdown_rx_pid));

    let listener = TcpListener::bind(cli.listen_addr)
        .await
        .wrap_err_with(|| format!("binding {}", cli.listen_addr))?;
    info!(addr = %cli.listen_addr, "listening for client connections");
    let accept_task = tokio::spawn(session::accept_loop(listener, work_tx, shutdown_tx.clone()));
    let metrics_task = tokio::spawn(monitoring::start_web_server(cli.metrics_port)?);

    accept_task.await?;
    metrics_task.await??;
    controller_task.await?;
    pid_task.await?;

    Ok(())
}
