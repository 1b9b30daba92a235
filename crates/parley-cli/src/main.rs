//! Parley CLI
//!
//! Peer negotiation and secure channel engine

mod config;
mod loopback;

use clap::{Parser, Subcommand};
use parley_core::{DEFAULT_CHANNEL_LABEL, IdentityManager};
use parley_crypto::NativeProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::Config;

/// Parley - authenticated peer negotiation and encrypted channels
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and print its peer id
    Keygen,

    /// Show the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },

    /// Run two in-process peers through a full session
    Loopback {
        /// Messages to send in each direction
        #[arg(short, long, default_value_t = 3)]
        messages: usize,

        /// Channel label
        #[arg(short, long, default_value = DEFAULT_CHANNEL_LABEL)]
        label: String,

        /// Padding added to each message, to exercise chunking
        #[arg(long, default_value_t = 0)]
        pad: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::load_or_default(&config_path)?,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
        .init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Keygen => generate_identity()?,
        Commands::Config { init } => show_config(&config, &config_path, init)?,
        Commands::Loopback {
            messages,
            label,
            pad,
        } => {
            loopback::run(
                &config.to_engine_config(),
                &config.signaling.room_url,
                &label,
                messages,
                pad,
            )
            .await?;
        }
    }

    Ok(())
}

/// Generate an identity. The secret key lives only for this process.
fn generate_identity() -> anyhow::Result<()> {
    let identity = IdentityManager::new(Arc::new(NativeProvider))?;

    println!("Peer ID:    {}", identity.peer_id());
    println!("Short ID:   {}", identity.peer_id().short());
    println!("Public key: {}", identity.public_key().to_base64());
    Ok(())
}

fn show_config(config: &Config, path: &Path, init: bool) -> anyhow::Result<()> {
    if init {
        if path.exists() {
            anyhow::bail!("Config already exists at {}", path.display());
        }
        Config::default().save(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
