//! Periodic controllers running beside the server.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Days, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{event::now, relay::Relay};

/// Scheduled events are checked a little more often than their publish lead.
pub const SCHEDULE_TICK: Duration = Duration::from_secs(65);
pub const RELOAD_TICK: Duration = Duration::from_secs(5);
pub const LIMITS_TICK: Duration = Duration::from_secs(60);

/// Time left until the next UTC midnight.
pub fn until_midnight(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc());
    next.and_then(|n| (n - now).to_std().ok())
        .unwrap_or(Duration::from_secs(86_400))
}

/// Run `tick` every `period` until `cancel` fires; the first tick is immediate.
async fn every<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => tick().await,
        }
    }
}

/// Start every controller; each stops when `cancel` fires.
pub fn spawn(relay: Arc<Relay>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    let r = relay.clone();
    tasks.push(tokio::spawn(every(SCHEDULE_TICK, cancel.clone(), move || {
        let r = r.clone();
        async move {
            let published = r.publish_scheduled(now());
            if published > 0 {
                info!(published, "scheduled events published");
            }
        }
    })));

    let r = relay.clone();
    tasks.push(tokio::spawn(every(RELOAD_TICK, cancel.clone(), move || {
        let r = r.clone();
        async move {
            match r.membership().reload_if_changed() {
                Ok(true) => info!(members = r.membership().member_count(), "membership log reloaded"),
                Ok(false) => {}
                Err(e) => error!("membership reload failed: {e}"),
            }
            if let Err(e) = r.reload_settings() {
                error!("settings reload failed: {e:#}");
            }
        }
    })));

    let r = relay.clone();
    tasks.push(tokio::spawn(every(LIMITS_TICK, cancel.clone(), move || {
        let r = r.clone();
        async move { r.limits().retain_recent() }
    })));

    let r = relay.clone();
    let c = cancel.clone();
    tasks.push(tokio::spawn(async move {
        loop {
            let wait = until_midnight(Utc::now());
            debug!(secs = wait.as_secs(), "paywall cache cleared at midnight");
            tokio::select! {
                _ = c.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    r.paywall().clear();
                    info!("paywall cache cleared");
                }
            }
        }
    }));

    let r = relay;
    let c = cancel;
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = c.cancelled() => break,
                _ = r.rebuild_wot() => {}
            }
            let hours = r.settings().inbox.wot_refresh_hours.max(1);
            tokio::select! {
                _ = c.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(hours * 3_600)) => {}
            }
        }
    }));

    tasks
}
