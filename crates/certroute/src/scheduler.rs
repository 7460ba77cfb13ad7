//! Renewal sweep scheduler.
//!
//! Wakes every second, checks the configured cron expression, and enqueues a
//! reconciliation pass when it fires, delayed by a bounded random jitter so a
//! fleet of instances does not hit the ACME service in the same instant.
//! The wait is interruptible: shutdown latency is bounded by one wake.

use crate::orchestrator::Sweep;
use crate::watcher::SharedSnapshot;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const WAKE_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(
    snapshot: SharedSnapshot,
    triggers: mpsc::Sender<Sweep>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("Renewal scheduler started");
    // Remember the last minute we fired in so one cron match is one sweep
    let mut last_fired: Option<String> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(WAKE_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Renewal scheduler stopping");
                    return Ok(());
                }
                continue;
            }
        }

        let (cron, jitter_max) = {
            let snap = snapshot.read().await;
            (
                snap.settings.renewal_cron.clone(),
                snap.settings.renewal_jitter_secs,
            )
        };

        let now = Utc::now();
        let minute_key = now.format("%Y-%m-%d %H:%M").to_string();
        if last_fired.as_deref() == Some(minute_key.as_str()) {
            continue;
        }
        if !cron_matches(&cron, &now) {
            continue;
        }
        last_fired = Some(minute_key);

        if jitter_max > 0 {
            let jitter = rand::rng().random_range(0..=jitter_max);
            debug!(jitter_secs = jitter, "Jittering renewal sweep");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(jitter)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }

        info!("Renewal sweep due");
        if triggers.send(Sweep::Scheduled).await.is_err() {
            // Orchestrator is gone; nothing left to schedule for
            return Ok(());
        }
    }
}

/// Match a standard 5-field cron expression (minute hour dom month dow)
/// against a timestamp.
fn cron_matches(cron_expr: &str, now: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = cron_expr.trim().split_whitespace().collect();
    if fields.len() != 5 {
        warn!("Invalid cron expression: {}", cron_expr);
        return false;
    }

    let minute = now.format("%M").to_string().parse::<u32>().unwrap_or(0);
    let hour = now.format("%H").to_string().parse::<u32>().unwrap_or(0);
    let dom = now.format("%d").to_string().parse::<u32>().unwrap_or(1);
    let month = now.format("%m").to_string().parse::<u32>().unwrap_or(1);
    let dow = now.format("%u").to_string().parse::<u32>().unwrap_or(1); // 1=Monday

    cron_field_matches(fields[0], minute)
        && cron_field_matches(fields[1], hour)
        && cron_field_matches(fields[2], dom)
        && cron_field_matches(fields[3], month)
        && cron_field_matches(fields[4], dow % 7) // 0=Sunday in cron
}

/// Match a single cron field against a value. Supports: *, */n, n, n-m, n,m,o
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }

    if let Some(step_str) = field.strip_prefix("*/") {
        if let Ok(step) = step_str.parse::<u32>() {
            return step > 0 && value % step == 0;
        }
        return false;
    }

    for part in field.split(',') {
        if let Some((start_str, end_str)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_str.parse::<u32>(), end_str.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(exact) = part.parse::<u32>() {
            if value == exact {
                return true;
            }
        }
    }

    false
}
