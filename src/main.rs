mod analytics;
mod attention;
mod attribution;
mod backup;
mod billing;
mod changes;
mod checkpoints;
mod cli;
mod config;
mod database;
mod error;
mod pages;
mod queue;
mod scans;
mod scheduler;
mod schema;
mod suggestions;
mod tiers;

use directories::ProjectDirs;
use log::{debug, error};

use crate::cli::Cli;
use crate::config::{Config, CONFIG};

fn main() {
    let config = match ProjectDirs::from("", "", "webpulse") {
        Some(project_dirs) => Config::load_config(&project_dirs),
        None => {
            eprintln!("Could not determine project directories. Using default configuration.");
            Config::default()
        }
    };

    // RUST_LOG overrides the configured level when set
    let logger_spec = format!("webpulse={}", config.logging.webpulse);
    let _logger = match flexi_logger::Logger::try_with_env_or_str(&logger_spec)
        .and_then(|logger| logger.start())
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    if CONFIG.set(config).is_err() {
        eprintln!("Configuration was already initialized.");
    }

    debug!(
        "Command-line args: {:?}",
        std::env::args_os().collect::<Vec<_>>()
    );

    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
