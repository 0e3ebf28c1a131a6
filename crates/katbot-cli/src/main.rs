//! Katbot plugin CLI.
//!
//! Inspects plugin directories offline (`discover`, `validate`, `scan`,
//! `resolve`, `tree`) and runs the plugin manager in the foreground (`run`).

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use katbot_plugins::PluginSystemConfig;
use katbot_telemetry::{LogConfig, LogFormat};

mod commands;

/// Katbot plugin manager
#[derive(Parser)]
#[command(name = "katbot-plugins")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogStyle::Compact)]
    log_format: LogStyle,

    /// Path to the plugin system configuration (TOML)
    #[arg(short, long, global = true, env = "KATBOT_PLUGINS_CONFIG")]
    config: Option<PathBuf>,

    /// Plugin directory, overriding the configuration
    #[arg(short = 'd', long, global = true)]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogStyle {
    Pretty,
    Compact,
    Json,
}

impl From<LogStyle> for LogFormat {
    fn from(style: LogStyle) -> Self {
        match style {
            LogStyle::Pretty => Self::Pretty,
            LogStyle::Compact => Self::Compact,
            LogStyle::Json => Self::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins found in the plugin directory
    Discover,

    /// Validate the manifest in a plugin directory
    Validate {
        /// Plugin directory
        path: PathBuf,
    },

    /// Run the security scan over a plugin's entry file
    Scan {
        /// Plugin directory
        path: PathBuf,
    },

    /// Resolve a plugin's dependencies against the plugin directory
    Resolve {
        /// Plugin id
        id: String,
    },

    /// Print a plugin's dependency tree
    Tree {
        /// Plugin id
        id: String,
    },

    /// Load every plugin and run until Ctrl-C
    Run {
        /// Watch plugin sources and reload on change
        #[arg(long)]
        hot_reload: bool,
    },
}

fn load_config(cli: &Cli) -> Result<PluginSystemConfig> {
    let mut config = match &cli.config {
        Some(path) => PluginSystemConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PluginSystemConfig::default(),
    };
    if let Some(dir) = &cli.plugin_dir {
        config.plugin_dir.clone_from(dir);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let log_config = LogConfig::new(level).with_format(cli.log_format.into());
    let _log_guard = match katbot_telemetry::setup_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        },
    };

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Discover => commands::inspect::discover(&config).await,
        Commands::Validate { path } => commands::inspect::validate(&config, &path).await,
        Commands::Scan { path } => commands::inspect::scan(&config, &path).await,
        Commands::Resolve { id } => commands::inspect::resolve(&config, &id).await,
        Commands::Tree { id } => commands::inspect::tree(&config, &id).await,
        Commands::Run { hot_reload } => commands::run::run(config, hot_reload).await,
    }
}
