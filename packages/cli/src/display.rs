// ABOUTME: Terminal rendering for token status, metrics, and providers
// ABOUTME: Builds comfy-table tables and human-readable durations

use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};

use warden_auth::oauth::{ProviderConfig, TokenMetrics, TokenSnapshot};
use warden_auth::{HealthStatus, RiskLevel};

/// `1h 5m`, `42s`, or `expired 3m 0s ago`
pub fn format_remaining(ms: i64) -> String {
    if ms <= 0 {
        return format!("expired {} ago", format_span(-ms));
    }
    format_span(ms)
}

fn format_span(ms: i64) -> String {
    let secs = ms / 1000;
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn colored_risk(risk: RiskLevel) -> ColoredString {
    match risk {
        RiskLevel::Low => risk.to_string().green(),
        RiskLevel::Medium => risk.to_string().yellow(),
        RiskLevel::High => risk.to_string().red(),
        RiskLevel::Critical => risk.to_string().red().bold(),
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_table(rows: &[(TokenSnapshot, HealthStatus)]) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "Provider",
        "User",
        "Expires",
        "Remaining",
        "Score",
        "Risk",
        "Refreshes",
        "Refreshable",
    ]);

    for (token, health) in rows {
        table.add_row(vec![
            token.key.provider.clone(),
            token.key.user_id.clone(),
            format_timestamp(token.expires_at),
            format_remaining(health.ms_until_expiry),
            health.health_score.to_string(),
            health.risk_level.to_string(),
            token.refresh_count.to_string(),
            if token.refreshable { "yes" } else { "no" }.to_string(),
        ]);
    }
    table
}

pub fn metrics_table(metrics: &TokenMetrics) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Provider", "Total", "Healthy", "Expired"]);
    for (provider, counts) in &metrics.by_provider {
        table.add_row(vec![
            provider.clone(),
            counts.total.to_string(),
            counts.healthy.to_string(),
            counts.expired.to_string(),
        ]);
    }
    table
}

pub fn providers_table<'a, I>(providers: I) -> Table
where
    I: IntoIterator<Item = &'a ProviderConfig>,
{
    let mut table = new_table();
    table.set_header(vec![
        "Provider",
        "Token URL",
        "Revoke",
        "Introspect",
        "Rotates",
        "Scopes",
        "Rate limit",
    ]);
    for provider in providers {
        table.add_row(vec![
            provider.name.clone(),
            provider.token_url.clone(),
            yes_no(provider.revoke_url.is_some()),
            yes_no(provider.introspect_url.is_some()),
            yes_no(provider.rotates_refresh_tokens),
            if provider.scopes.is_empty() {
                "-".to_string()
            } else {
                provider.scopes.join(" ")
            },
            match provider.rate_limit_rpm {
                0 => "off".to_string(),
                rpm => format!("{}/min", rpm),
            },
        ]);
    }
    table
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}
