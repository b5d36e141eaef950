// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

mod config;
mod web;

use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use fluxion_surplus_core::{DeviceMemoryStore, DistributionBoard, SurplusEntry, SystemClock};
use fluxion_surplus_ha::{HomeAssistantClient, HomeAssistantEntityController};
use web::WebState;

/// FluxION Surplus - solar excess power allocator
#[derive(Debug, Parser)]
#[command(name = "fluxion-surplus", version, about)]
struct Cli {
    /// Configuration file (TOML or JSON); searched in the default locations when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = AppConfig::load(cli.config.as_deref())?;

    init_tracing(&config.system.log_level);
    info!("🚀 Starting FluxION Surplus");
    info!("✅ Loaded configuration from {}", source);

    if cli.validate {
        return report_validation(&config);
    }
    config.validate()?;

    info!("📋 Configuration Summary:");
    for entry in &config.entries {
        info!(
            "   {} ({} devices, poll {}s, watchdog {}s)",
            entry.display_name(),
            entry.devices.len(),
            entry.poll_interval_secs,
            entry.watchdog.stale_after_secs
        );
    }

    let ha_client = Arc::new(
        HomeAssistantClient::from_config(
            config.system.ha_base_url.clone(),
            config.system.ha_token.clone(),
        )
        .context("Failed to initialize Home Assistant client")?,
    );
    if !ha_client.ping().await? {
        warn!("⚠️ Home Assistant is not reachable yet; entries will retry every poll");
    }

    let timezone = resolve_timezone(&config, &ha_client).await?;
    info!("🌍 Schedules evaluated in {}", timezone);

    let controller = Arc::new(HomeAssistantEntityController::new(ha_client));
    let board = DistributionBoard::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut entries = Vec::with_capacity(config.entries.len());
    let mut tasks = Vec::with_capacity(config.entries.len());
    for entry_config in &config.entries {
        board.register(&entry_config.id);
        let store = DeviceMemoryStore::for_entry(&config.system.state_dir, &entry_config.id);
        let entry = Arc::new(
            SurplusEntry::new(
                entry_config.clone(),
                timezone,
                controller.clone(),
                Arc::new(board.clone()),
                Arc::new(SystemClock),
            )
            .with_memory_store(store),
        );
        tasks.push(tokio::spawn(entry.clone().run(shutdown_tx.subscribe())));
        entries.push(entry);
    }

    let web_state = WebState {
        board,
        entries: Arc::new(entries),
    };
    let web_port = config.system.web_port;
    let mut web_task = tokio::spawn(web::serve(web_state, web_port));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        result = &mut web_task => {
            match result {
                Ok(Ok(())) => warn!("Web server stopped"),
                Ok(Err(e)) => error!("❌ Web server failed: {:#}", e),
                Err(e) => error!("❌ Web server task panicked: {}", e),
            }
        }
    }

    // Receivers may already be gone if every entry stopped
    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            error!("❌ Entry task failed: {}", e);
        }
    }
    web_task.abort();

    info!("Shutting down");
    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,fluxion_surplus={log_level}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn report_validation(config: &AppConfig) -> Result<()> {
    let result = config.validate_detailed();
    for warning in &result.warnings {
        warn!("⚠️ {}: {}", warning.field, warning.message);
    }
    for issue in &result.errors {
        error!("❌ {}: {}", issue.field, issue.message);
    }

    if !result.valid {
        bail!("Configuration is invalid ({} error(s))", result.errors.len());
    }
    info!(
        "✅ Configuration is valid ({} entries, {} warnings)",
        config.entries.len(),
        result.warnings.len()
    );
    Ok(())
}

async fn resolve_timezone(config: &AppConfig, client: &HomeAssistantClient) -> Result<Tz> {
    if let Some(tz) = config.timezone()? {
        return Ok(tz);
    }

    match client.get_timezone().await {
        Ok(name) => name
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Home Assistant reported invalid timezone '{name}': {e}")),
        Err(e) => {
            warn!("⚠️ Could not fetch timezone from Home Assistant ({}), using UTC", e);
            Ok(chrono_tz::UTC)
        }
    }
}
