use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use passportbuddy::config::{BuddyConfig, LoggingConfig};
use passportbuddy::{BackendClient, Notice, RequestQueue};

#[derive(Parser)]
#[command(
    name = "passportbuddy",
    about = "Rate-limited, retrying request queue for the Passport Buddy client",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (overrides PASSPORTBUDDY_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Toggle a like on a post through the request queue
    Like {
        /// Post identifier
        #[arg(long)]
        post_id: String,

        /// Submit the toggle this many times at once
        #[arg(long, default_value = "1")]
        times: u32,

        /// Backend base URL (overrides [backend] base_url)
        #[arg(long)]
        api_url: Option<String>,

        /// Print queue stats as JSON when done
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

/// Resolve the config under a stderr subscriber at `warn`, so fallback
/// warnings are seen before the configured subscriber exists.
fn load_config(explicit: Option<&Path>) -> Result<BuddyConfig> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || match explicit {
        Some(path) => BuddyConfig::load(path),
        None => Ok(BuddyConfig::load_or_default()),
    })
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;

    init_tracing(&config.logging);

    match cli.command {
        Commands::Like {
            post_id,
            times,
            api_url,
            json,
        } => {
            if let Some(url) = api_url {
                config.backend.base_url = url;
            }
            tracing::info!(%post_id, %times, base_url = %config.backend.base_url, "Toggling like");

            let queue = RequestQueue::new(config.queue.clone());
            let client = BackendClient::new(&config.backend, queue.clone())?;

            let handles: Vec<_> = (0..times).map(|_| client.toggle_like(&post_id)).collect();
            for (i, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(status) => {
                        println!("#{:<3} liked={:<5} likes={}", i + 1, status.liked, status.likes);
                    }
                    Err(e) => {
                        println!("#{:<3} {} ({})", i + 1, Notice::for_error(&e).message(), e);
                    }
                }
            }

            let stats = queue.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "\nadmitted={} rate_limited={} retried={} fulfilled={} rejected={}",
                    stats.admitted, stats.rate_limited, stats.retried, stats.fulfilled, stats.rejected
                );
            }
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
