// ABOUTME: CLI commands that inspect and operate on stored tokens
// ABOUTME: Import, status, metrics, refresh, revoke, remove, and provider listing

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use colored::*;

use warden_auth::{LifecycleManager, ProviderRegistry, RiskLevel};
use warden_cli::display::{
    colored_risk, format_remaining, format_timestamp, metrics_table, providers_table, status_table,
};
use warden_cli::import::load_token_specs;
use warden_core::{now_millis, TokenKey};

use super::open_manager;

pub async fn import_command(file: &Path) -> Result<()> {
    let specs = load_token_specs(file)?;
    println!(
        "{}",
        format!("📄 Importing {} token(s) from {}", specs.len(), file.display())
            .bold()
            .cyan()
    );

    let manager = open_manager().await?;
    let mut success_count = 0;
    let mut error_count = 0;

    for spec in specs {
        let label = format!("{}:{}", spec.provider, spec.user_id);
        match manager.store_token(spec).await {
            Ok(_) => {
                println!("  {} {}", "✓".green().bold(), label);
                success_count += 1;
            }
            Err(e) => {
                eprintln!("  {} {}: {}", "✗".red().bold(), label, e);
                error_count += 1;
            }
        }
    }
    manager.shutdown().await;

    println!();
    println!(
        "Imported {} token(s), {} error(s)",
        success_count.to_string().green().bold(),
        error_count
    );
    if error_count > 0 {
        anyhow::bail!("{} token(s) could not be imported", error_count);
    }
    Ok(())
}

pub async fn status_command() -> Result<()> {
    let manager = open_manager().await?;
    let result = print_status(&manager).await;
    manager.shutdown().await;
    result
}

async fn print_status(manager: &LifecycleManager) -> Result<()> {
    let tokens = manager.list_tokens().await?;
    if tokens.is_empty() {
        println!("{}", "No tokens stored".yellow());
        println!(
            "{}",
            "Use 'warden import <file>' to store your first token".dimmed()
        );
        return Ok(());
    }

    println!("{}", "🔐 Token Health".bold().cyan());
    println!();

    let mut rows = Vec::with_capacity(tokens.len());
    for token in tokens {
        let health = manager
            .get_token_health(&token.key.provider, &token.key.user_id)
            .await?;
        // Removed between listing and reading
        if let Some(health) = health {
            rows.push((token, health));
        }
    }

    let mut by_risk: BTreeMap<RiskLevel, usize> = BTreeMap::new();
    for (_, health) in &rows {
        *by_risk.entry(health.risk_level).or_default() += 1;
    }

    println!("{}", status_table(&rows));
    let summary: Vec<String> = by_risk
        .iter()
        .map(|(risk, count)| format!("{} {}", count, colored_risk(*risk)))
        .collect();
    println!("Total: {} token(s) ({})", rows.len().to_string().cyan(), summary.join(", "));
    Ok(())
}

pub async fn metrics_command() -> Result<()> {
    let manager = open_manager().await?;
    let metrics = manager.collect_metrics().await;
    manager.shutdown().await;
    let metrics = metrics?;

    println!("{}", "📊 Token Metrics".bold().cyan());
    println!();
    println!("  Total:           {}", metrics.total.to_string().bold());
    println!("  Active:          {}", metrics.active.to_string().green());
    println!("  Expired:         {}", metrics.expired.to_string().red());
    println!(
        "  Needing refresh: {}",
        metrics.needing_refresh.to_string().yellow()
    );
    println!("  Generated:       {}", format_timestamp(metrics.generated_at));

    if !metrics.by_provider.is_empty() {
        println!();
        println!("{}", metrics_table(&metrics));
    }
    Ok(())
}

pub async fn refresh_command(provider: &str, user: &str) -> Result<()> {
    let manager = open_manager().await?;
    let key = TokenKey::new(provider, user);
    println!("{}", format!("🔄 Refreshing {}...", key).bold().cyan());

    let result = manager.refresh_token(&key).await;
    manager.shutdown().await;
    let token = result.with_context(|| format!("Refresh failed for {}", key))?;

    println!("{} Token refreshed", "✓".green().bold());
    println!(
        "   Expires: {} ({})",
        format_timestamp(token.expires_at).green(),
        format_remaining(token.expires_at.timestamp_millis() - now_millis().timestamp_millis())
    );
    println!("   Refresh count: {}", token.refresh_count);
    Ok(())
}

pub async fn revoke_command(provider: &str, user: &str) -> Result<()> {
    let manager = open_manager().await?;
    let key = TokenKey::new(provider, user);
    println!("{}", format!("🔓 Revoking {}...", key).bold().cyan());

    let result = manager.revoke_token(provider, user).await;
    manager.shutdown().await;
    result.with_context(|| format!("Revocation failed for {}", key))?;

    println!("{} Token revoked and removed", "✓".green().bold());
    Ok(())
}

pub async fn remove_command(provider: &str, user: &str) -> Result<()> {
    let manager = open_manager().await?;
    let key = TokenKey::new(provider, user);

    let result = manager.remove_token(provider, user).await;
    manager.shutdown().await;

    if result? {
        println!("{} Removed token for {}", "✓".green().bold(), key);
    } else {
        println!("{} No token stored for {}", "ℹ".cyan(), key);
    }
    Ok(())
}

pub fn providers_command() -> Result<()> {
    let registry = ProviderRegistry::from_env().context("Invalid provider configuration")?;
    if registry.is_empty() {
        println!("{}", "No OAuth providers configured".yellow());
        println!(
            "{}",
            "Set WARDEN_<PROVIDER>_CLIENT_ID (e.g. WARDEN_GOOGLE_CLIENT_ID) to enable one".dimmed()
        );
        return Ok(());
    }

    let mut providers: Vec<_> = registry.iter().collect();
    providers.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{}", "🔌 OAuth Providers".bold().cyan());
    println!();
    println!("{}", providers_table(providers));
    Ok(())
}
