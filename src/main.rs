mod backup;
mod cli;
mod config;
mod database;
mod error;
mod log;
mod notify;
mod shutdown;
mod storage;

use clap::Parser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    log::init(args.log_format);

    let (trigger, shutdown) = shutdown::channel();
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));

    let handler = ctrlc::set_handler(move || {
        let count = ctrl_c_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            eprintln!("\n\nShutdown signal received. Press Ctrl+C again to force exit...");
            trigger.trigger();
        } else {
            eprintln!("\nForce exiting...");
            std::process::exit(130);
        }
    });
    if let Err(e) = handler {
        error!("Error setting Ctrl-C handler: {}", e);
        std::process::exit(2);
    }

    let code = cli::execute(args, shutdown).await;
    info!(exit_code = code, "pg-backup-agent exiting");
    std::process::exit(code);
}
