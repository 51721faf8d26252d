//! TaalIO - board agent entry point

use std::env;
use std::sync::atomic::Ordering;

use taal_io::error::{Error, Result};
use taal_io::scheduler::Scheduler;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("TaalIO v{} starting...", env!("CARGO_PKG_VERSION"));

    let arguments: Vec<String> = env::args().skip(1).collect();
    let mut scheduler = Scheduler::new(arguments)?;

    // Bind SIGINT to the scheduler's run flag for a graceful shutdown.
    let running = scheduler.run_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    scheduler.run();

    log::info!("TaalIO stopped");
    Ok(())
}
