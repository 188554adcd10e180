use clap::Parser;
use std::{net::SocketAddr, path::PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address and port to accept client connections on
    #[arg(long, default_value = "0.0.0.0:7000")]
    pub listen_addr: SocketAddr,
    /// Port to respond to prometheus requests for metrics
    #[arg(long, default_value_t = 8083)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub metrics_port: u16,
    /// Startup channel registry, `[PID]` + one `[CH<n>]` section per channel
    #[arg(long, default_value = "wavemeter.ini")]
    pub config_path: PathBuf,
    /// Directory `SCF` configuration snapshots are written to
    #[arg(long, default_value = ".")]
    pub snapshot_dir: PathBuf,
    /// Run against the simulated wavemeter/DAC instead of real hardware
    #[arg(long)]
    pub skip_hardware: bool,
}
