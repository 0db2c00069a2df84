use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Optional TOML config file to read configuration from. Any flag
    /// below overrides the matching key when both are given.
    pub config_file: Option<PathBuf>,
    /// Address to listen on. Overrides `server.listen` in the config file.
    #[arg(short, long)]
    pub listen: Option<IpAddr>,
    /// (TCP) port to listen on. Overrides `server.port` in the config file.
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Enables write-ahead logging and sets the directory to store WAL
    /// files in. Overrides `wal.enable`/`wal.dir` in the config file.
    #[arg(short = 'b', long)]
    pub wal_dir: Option<PathBuf>,
    /// Sets the maximum allowed job size. Overrides `job.max-size` in the
    /// config file.
    #[arg(short = 'z', long)]
    pub max_job_size: Option<u32>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
