// ABOUTME: `warden serve` runs the lifecycle manager in the foreground
// ABOUTME: Logs lifecycle events until Ctrl-C, then shuts down cleanly

use anyhow::{Context, Result};
use colored::*;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use warden_auth::LifecycleEvent;

use super::open_manager;

pub async fn serve_command() -> Result<()> {
    let manager = open_manager().await?;
    let mut events = manager.subscribe();

    let armed = manager.start().await?;
    println!(
        "{} Warden running: {} provider(s), {} refresh job(s) armed",
        "✓".green().bold(),
        manager.registry().len(),
        armed
    );
    println!("   Press {} to stop", "Ctrl-C".yellow());

    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event log fell behind; {} event(s) skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!();
    println!("{}", "Shutting down...".cyan());
    manager.shutdown().await;
    event_log.abort();
    println!("{} Stopped", "✓".green().bold());
    Ok(())
}

fn log_event(event: &LifecycleEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(event = event.name(), key = %event.key(), "{}", json),
        Err(_) => info!(event = event.name(), key = %event.key(), "lifecycle event"),
    }
}
