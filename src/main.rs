mod cli;
mod config;
mod db;
mod error;
mod executor;
mod ledger;
mod migrations;
mod ops;
mod planner;
mod reports;
mod runner;
mod schema;

use std::thread;

use clap::Parser;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{debug, error, warn};

use crate::cli::Cli;
use crate::config::LoggingConfig;
use crate::executor::CancelToken;

fn main() {
    let cli = Cli::parse();
    let config = cli.load_config();

    // Keep the handle alive for the whole run or file output stops
    let _logger = match setup_logging(&config.logging) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    let cancel = CancelToken::new();
    watch_for_interrupt(cancel.clone());

    match cli.handle_command_line(&config, &cancel) {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}

fn setup_logging(logging: &LoggingConfig) -> Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(&logging.level)?;

    let logger = match &logging.directory {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("prazos-schema"))
            .rotate(
                Criterion::Size(10 * 1024 * 1024),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(7),
            )
            .duplicate_to_stderr(Duplicate::Warn)
            .write_mode(WriteMode::BufferAndFlush),
        None => logger.log_to_stderr(),
    };

    logger.start()
}

/// Ctrl-C flips the cancel token; the executor stops before its next operation.
fn watch_for_interrupt(cancel: CancelToken) {
    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("Interrupt handling unavailable: {e}");
                return;
            }
        };

        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing the current operation");
                cancel.cancel();
            }
        });
    });
}
