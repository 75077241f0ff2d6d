//! Worker process entry point.
//!
//! Spawned by the main Medley process with a socket path to connect back to.
//! Standard streams are for logging only; everything else goes over the
//! socket.
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use medley_worker::ipc::WorkerConnection;
use medley_worker::worker::{Dispatcher, DispatcherOptions, StockHandlers};

#[derive(Parser, Debug)]
#[command(
    name = "medley-workerd",
    version,
    about = "Medley's task worker process. Not meant to be run by hand."
)]
struct Args {
    /// Unix socket the parent process is listening on.
    #[arg(long)]
    socket_path: PathBuf,

    /// Wall-clock budget for a single tag extraction, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    tag_deadline_ms: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("worker terminated: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> medley_worker::Result<()> {
    let stream = UnixStream::connect(&args.socket_path)?;
    let conn = WorkerConnection::new(stream)?;
    let options = DispatcherOptions {
        tag_deadline: Duration::from_millis(args.tag_deadline_ms),
    };
    Dispatcher::new(conn, Arc::new(StockHandlers), options).run()
}
