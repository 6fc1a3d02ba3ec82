//! Main entry point for the supervisord binary.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use supervisor::{logging, ServerConfig, Supervisor, SupervisorResult, SupervisorState};

/// Starts and supervises a set of child processes.
#[derive(Parser)]
#[command(name = "supervisord")]
#[command(about = "Starts and supervises a set of child processes")]
pub struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Stay in the foreground instead of daemonizing
    #[arg(short, long)]
    pub nodaemon: bool,

    /// Pidfile location, overriding the configuration file
    #[arg(long)]
    pub pidfile: Option<PathBuf>,
}

fn load_config(args: &Args) -> SupervisorResult<ServerConfig> {
    let mut config: ServerConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };
    if args.nodaemon {
        config.nodaemon = true;
    }
    if let Some(pidfile) = &args.pidfile {
        config.pidfile = pidfile.clone();
    }
    Ok(config)
}

fn main() -> SupervisorResult<()> {
    let args = Args::parse();
    logging::init_tracing(&args.log_level);

    // SIGHUP asks for a restart: tear the whole supervisor down and
    // build a fresh one from a re-read configuration.
    loop {
        let config = load_config(&args)?;
        let mut supervisor = Supervisor::new(config)?;
        match supervisor.run()? {
            SupervisorState::Restarting => {
                info!("restarting supervisor");
            }
            state => {
                info!("supervisor exiting ({state})");
                break;
            }
        }
    }
    Ok(())
}
