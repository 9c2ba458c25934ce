// ABOUTME: Health monitor sweeping the pool on a fixed interval
// ABOUTME: Revokes expired leases, probes stale sandboxes, terminates unhealthy ones and restores baseline

use crate::manager::{PoolManager, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Leases revoked because their deadline passed
    pub expired: usize,
    pub probed: usize,
    /// Slots whose liveness probe failed
    pub unhealthy: usize,
    pub idle_drained: usize,
    pub terminated: usize,
    pub termination_failures: usize,
    /// Replacement provisions started
    pub replacements: usize,
}

/// Background sweeper over the pool registry
pub struct HealthMonitor {
    pool: Arc<PoolManager>,
    running: Arc<RwLock<bool>>,
    stop: Arc<Notify>,
    last_report: Arc<RwLock<Option<SweepReport>>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self {
            pool,
            running: Arc::new(RwLock::new(false)),
            stop: Arc::new(Notify::new()),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the sweep task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let pool = self.pool.clone();
        let running_flag = self.running.clone();
        let stop = self.stop.clone();
        let last_report = self.last_report.clone();
        let interval = pool.settings().sweep_interval;

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "Health monitor started");

            loop {
                tokio::select! {
                    _ = time::sleep(interval) => {}
                    _ = stop.notified() => {}
                }

                if !*running_flag.read().await {
                    info!("Health monitor stopped");
                    break;
                }

                match Self::sweep(&pool).await {
                    Ok(report) => *last_report.write().await = Some(report),
                    Err(e) => error!(error = %e, "Health sweep failed"),
                }
            }
        });
    }

    /// Stop the sweep task after its current pass
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.stop.notify_one();
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn last_report(&self) -> Option<SweepReport> {
        self.last_report.read().await.clone()
    }

    /// Run a single sweep immediately
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let report = Self::sweep(&self.pool).await?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn sweep(pool: &Arc<PoolManager>) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        report.expired = pool.expire_leases(started)?.len();

        // Probes run without the registry lock
        let stale = pool.stale_slots(started)?;
        report.probed = stale.len();
        let controller = pool.controller().clone();
        let outcomes = join_all(stale.into_iter().map(|(slot_id, endpoint)| {
            let controller = controller.clone();
            async move {
                let healthy = controller.probe(&endpoint).await;
                (slot_id, healthy)
            }
        }))
        .await;

        let probed_at = Instant::now();
        for (slot_id, healthy) in outcomes {
            if pool.record_probe(&slot_id, healthy, probed_at)? {
                report.unhealthy += 1;
            }
        }

        let mut doomed = pool.drain_idle(probed_at)?;
        report.idle_drained = doomed.len();
        doomed.extend(pool.claim_for_termination()?);

        if !doomed.is_empty() {
            debug!(count = doomed.len(), "Terminating drained slots");
        }
        for terminated in join_all(doomed.iter().map(|slot_id| pool.destroy(slot_id))).await {
            if terminated {
                report.terminated += 1;
            } else {
                report.termination_failures += 1;
            }
        }

        report.replacements = pool.replenish()?.len();
        report.duration_ms = started.elapsed().as_millis() as u64;

        let snapshot = pool.snapshot()?;
        info!(
            total = snapshot.counts.total,
            free = snapshot.counts.free,
            allocated = snapshot.counts.allocated,
            provisioning = snapshot.counts.provisioning,
            unhealthy = snapshot.counts.unhealthy,
            draining = snapshot.counts.draining,
            waiters = snapshot.waiters,
            expired = report.expired,
            terminated = report.terminated,
            replacements = report.replacements,
            "Pool status"
        );
        if report.termination_failures > 0 {
            warn!(
                failures = report.termination_failures,
                "Some slots could not be terminated, retrying next sweep"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryProvider;
    use crate::settings::PoolSettings;
    use std::time::Duration;

    fn settings(baseline: usize, max: usize) -> PoolSettings {
        PoolSettings {
            baseline_size: baseline,
            max_size: max,
            sweep_interval: Duration::from_millis(20),
            provision_backoff: Duration::from_millis(5),
            ..PoolSettings::default()
        }
    }

    async fn monitored(
        settings: PoolSettings,
    ) -> (Arc<InMemoryProvider>, Arc<PoolManager>, HealthMonitor) {
        let provider = Arc::new(InMemoryProvider::new());
        let pool = PoolManager::new(provider.clone(), settings).unwrap();
        pool.warm_up().await.unwrap();
        let monitor = HealthMonitor::new(pool.clone());
        (provider, pool, monitor)
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_and_replaced() {
        let (provider, pool, monitor) = monitored(settings(1, 2)).await;
        let lease = pool
            .acquire("crashed-worker", Some(Duration::from_millis(30)), None)
            .await
            .unwrap();

        time::sleep(Duration::from_millis(50)).await;
        let report = monitor.sweep_once().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.terminated, 1);
        assert_eq!(report.replacements, 1);
        assert!(!provider.contains(&lease.slot_id).await);

        time::sleep(Duration::from_millis(30)).await;
        let snapshot = pool.snapshot().unwrap();
        assert_eq!(snapshot.counts.free, 1);
        assert_eq!(snapshot.stats.total_expired, 1);
    }

    #[tokio::test]
    async fn test_failed_probe_marks_slot_unhealthy() {
        let (provider, pool, monitor) = monitored(PoolSettings {
            probe_staleness: Duration::ZERO,
            ..settings(2, 2)
        })
        .await;

        let victim = pool.slots().unwrap()[0].clone();
        provider
            .mark_unhealthy(victim.endpoint.as_deref().unwrap())
            .await;

        let report = monitor.sweep_once().await.unwrap();
        assert_eq!(report.probed, 2);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.terminated, 1);

        time::sleep(Duration::from_millis(30)).await;
        let slots = pool.slots().unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| s.slot_id != victim.slot_id));
        assert_eq!(pool.snapshot().unwrap().stats.total_unhealthy, 1);
    }

    #[tokio::test]
    async fn test_idle_burst_capacity_is_drained() {
        let (provider, pool, monitor) = monitored(PoolSettings {
            idle_timeout: Some(Duration::from_millis(10)),
            ..settings(1, 3)
        })
        .await;

        let mut leases = Vec::new();
        for owner in ["a", "b", "c"] {
            leases.push(pool.acquire(owner, None, None).await.unwrap());
        }
        for lease in &leases {
            pool.release(&lease.slot_id, &lease.owner_id).unwrap();
        }
        time::sleep(Duration::from_millis(20)).await;

        let report = monitor.sweep_once().await.unwrap();
        assert_eq!(report.idle_drained, 2);
        assert_eq!(report.replacements, 0);
        assert_eq!(pool.snapshot().unwrap().counts.free, 1);
        assert_eq!(provider.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_healthy_pool_sweep_is_quiet() {
        let (_provider, _pool, monitor) = monitored(settings(2, 4)).await;

        let report = monitor.sweep_once().await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.probed, 0);
        assert_eq!(report.terminated, 0);
        assert_eq!(report.replacements, 0);
        assert_eq!(monitor.last_report().await, Some(report));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (_provider, _pool, monitor) = monitored(settings(1, 1)).await;

        monitor.start().await;
        assert!(monitor.is_running().await);

        time::sleep(Duration::from_millis(60)).await;
        assert!(monitor.last_report().await.is_some());

        monitor.stop().await;
        assert!(!monitor.is_running().await);
    }
}
