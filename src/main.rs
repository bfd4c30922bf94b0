use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use preview_manager::config::Settings;
use preview_manager::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "preview-manager")]
#[command(version, about = "Ephemeral preview environments for GitLab merge requests")]
pub struct Cli {
    /// Path to a TOML config file. Overrides PREVIEW_CONFIG.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server, webhook receiver and background loops
    Serve {
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local dashboard)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and apply migrations, then exit
    InitDb,
    /// Remount every overlay once, then exit
    Remount,
    /// Read or write persisted runtime policy
    Settings {
        #[command(subcommand)]
        command: Option<SettingsCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SettingsCommands {
    /// List every stored setting
    List,
    /// Print one setting
    Get { key: String },
    /// Store a setting
    Set { key: String, value: String },
    /// Remove a setting
    Unset { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let log_dir = match cli.command {
        Commands::Serve { .. } => settings.log_dir.clone(),
        _ => None,
    };
    let _log_guard = logging::init(&settings.log_format, log_dir.as_deref())?;

    match cli.command {
        Commands::Serve { host, port, dev } => cmd::cmd_serve(settings, host, port, dev).await?,
        Commands::InitDb => cmd::cmd_init_db(&settings)?,
        Commands::Remount => cmd::cmd_remount(&settings).await?,
        Commands::Settings { command } => cmd::cmd_settings(&settings, command)?,
    }

    Ok(())
}
