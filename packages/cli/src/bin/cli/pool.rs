// ABOUTME: Operator commands against a running scheduler (status and scale)
// ABOUTME: Renders pool health and slot listings as tables

use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandpool_client::{ClientConfig, PoolHealth, SchedulerClient, SlotSummary};

fn connect(url: &str) -> Result<SchedulerClient> {
    SchedulerClient::new(ClientConfig::new(url)).context("Invalid scheduler URL")
}

pub async fn status_command(url: &str, show_slots: bool) -> Result<()> {
    let client = connect(url)?;
    let health = client
        .health()
        .await
        .with_context(|| format!("Failed to reach scheduler at {}", url))?;

    print_health(&health);

    if show_slots {
        let slots = client.slots().await.context("Failed to list slots")?;
        println!();
        print_slots(&slots);
    }

    Ok(())
}

pub async fn scale_command(url: &str, baseline: usize) -> Result<()> {
    let client = connect(url)?;
    let outcome = client
        .scale(baseline)
        .await
        .with_context(|| format!("Failed to scale pool to {}", baseline))?;

    println!(
        "{} Baseline {} → {}",
        "✓".green().bold(),
        outcome.previous_baseline,
        outcome.baseline_size.to_string().cyan()
    );
    if outcome.provisioning > 0 {
        println!("  Provisioning {} sandbox(es)", outcome.provisioning);
    }
    if outcome.drained > 0 {
        println!("  Drained {} idle sandbox(es)", outcome.drained);
    }
    Ok(())
}

fn print_health(health: &PoolHealth) {
    let status = if health.accepting {
        health.status.green().bold()
    } else {
        health.status.yellow().bold()
    };
    println!(
        "{} {} ({} backend, v{})",
        "Sandbox pool".blue().bold(),
        status,
        health.backend,
        health.version
    );
    if let Some(root) = &health.session_root {
        println!("Session root: {}", root);
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        "Baseline",
        "Max",
        "Total",
        "Free",
        "Allocated",
        "Provisioning",
        "Unhealthy",
        "Draining",
        "Waiters",
    ]);
    table.add_row(vec![
        health.baseline_size.to_string(),
        health.max_size.to_string(),
        health.total.to_string(),
        health.free.to_string(),
        health.allocated.to_string(),
        health.provisioning.to_string(),
        health.unhealthy.to_string(),
        health.draining.to_string(),
        health.waiters.to_string(),
    ]);
    println!("{}", table);

    let stats = &health.stats;
    println!(
        "Created {}  Allocated {}  Released {}  Expired {}  Unhealthy {}  Failed {}  Uptime {}s",
        stats.total_created,
        stats.total_allocated,
        stats.total_released,
        stats.total_expired.to_string().yellow(),
        stats.total_unhealthy.to_string().yellow(),
        stats.total_failed.to_string().red(),
        health.uptime_secs
    );
}

fn print_slots(slots: &[SlotSummary]) {
    if slots.is_empty() {
        println!("{}", "No slots".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Slot", "State", "Endpoint", "Owner", "Lease left", "Error"]);

    let now = Utc::now();
    for slot in slots {
        let lease_left = slot
            .lease_expires_at
            .map(|at| format!("{}s", (at - now).num_seconds().max(0)))
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            slot.slot_id.clone(),
            slot.state.clone(),
            slot.endpoint.clone().unwrap_or_else(|| "-".to_string()),
            slot.owner_id.clone().unwrap_or_else(|| "-".to_string()),
            lease_left,
            slot.last_error.clone().unwrap_or_default(),
        ]);
    }

    println!("{}", table);
    println!("Total: {} slots", slots.len().to_string().cyan());
}
