//! Foreground plugin host.

use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use katbot_plugins::{ModuleCatalog, PluginEventKind, PluginManager, PluginSystemConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) async fn run(config: PluginSystemConfig, hot_reload: bool) -> Result<()> {
    let hot_reload = hot_reload || config.hot_reload.enabled;
    let manager = Arc::new(PluginManager::new(config, ModuleCatalog::new())?);

    let _subscription = manager.events().subscribe(None, |event| {
        if event.kind == PluginEventKind::Error {
            warn!(
                plugin_id = %event.plugin_id,
                error = event.error.as_deref().unwrap_or_default(),
                "Plugin error"
            );
        } else {
            info!(plugin_id = %event.plugin_id, event = %event.kind, "Plugin event");
        }
    });

    let report = manager.load_all().await?;
    for (plugin, error) in &report.failed {
        println!("  {} {plugin}: {error}", "FAIL".red());
    }
    println!(
        "{} {} plugins loaded, {} failed",
        "Katbot".cyan().bold(),
        report.loaded.len(),
        report.failed.len()
    );

    if hot_reload {
        for id in &report.loaded {
            if let Err(e) = manager.enable_hot_reload(id) {
                warn!(plugin_id = %id, error = %e, "Hot reload unavailable");
            }
        }
    }

    let cancel = CancellationToken::new();
    let monitor = manager.spawn_health_monitor(cancel.clone());

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    cancel.cancel();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Health monitor task failed");
    }
    manager.shutdown().await;
    Ok(())
}
