#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use chrono::Local;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use log::{error, info};
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::PathBuf;

use dlv_bridge::dap_server;

/// DAP bridge for a headless Go debugger backend
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Write the adapter log to this file instead of the temp directory.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Speak DAP on stdin/stdout.
    Stdio,
    /// Listen for one DAP client on a local TCP port.
    Tcp {
        #[arg(long, default_value_t = 4711)]
        port: u16,
    },
}

fn panic_handler(info: &PanicHookInfo) {
    error!("PANIC!!! {}", info);
}

fn main() -> Result<(), Box<dyn Error>> {
    panic::set_hook(Box::new(panic_handler));

    let cli = Args::parse();

    let log_path = cli
        .log_file
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("dlv-bridge.log"));
    let target = Box::new(File::create(&log_path)?);
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(target))
        .filter(None, level)
        .init();

    info!("logging from dlv-bridge, pid {:?}", std::process::id());

    match cli.cmd {
        Commands::Stdio => dap_server::run_stdio(),
        Commands::Tcp { port } => dap_server::run_tcp(port),
    }
}
