use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

use syftbox_sync::config::{Config, ConfigOverrides};
use syftbox_sync::daemon::{self, DaemonOptions};

#[derive(Parser, Debug)]
#[command(name = "syftbox-sync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon
    Daemon {
        /// Full-sync interval in seconds
        #[arg(long = "interval", default_value_t = 5)]
        interval: u64,

        /// Log file path (defaults next to the config file)
        #[arg(long = "log-file")]
        log_file: Option<PathBuf>,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    match command {
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("syftbox-sync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Daemon { interval, log_file }) => {
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            let opts = DaemonOptions {
                log_path: log_file,
                sync_interval: Some(Duration::from_secs(interval.max(1))),
                ..DaemonOptions::default()
            };
            run_daemon(cfg, opts).await
        }
        None => {
            // No subcommand runs the daemon with defaults.
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg, DaemonOptions::default()).await
        }
    }
}

async fn run_daemon(cfg: Config, opts: DaemonOptions) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.notify_waiters();
            }
        });
    }
    daemon::run_daemon_with_shutdown(cfg, opts, shutdown).await
}
