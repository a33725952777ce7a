//! Background maintenance
//!
//! Two periodic sweeps: rolling over expired accounting periods, and removing
//! stale device sightings. Both run on blocking threads because they touch
//! the ledger.

use crate::config::JobsConfig;
use crate::devices::DeviceTracker;
use crate::error::Result;
use crate::ingest::blocking;
use crate::metrics::{names, MetricsSink};
use crate::period::{PeriodManager, SweepReport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Close and reopen every expired period once
pub async fn run_period_sweep(
    periods: Arc<PeriodManager>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<SweepReport> {
    let report = blocking(move || periods.sweep(Utc::now())).await?;
    if report.closed > 0 {
        metrics.increment_by(names::PERIODS_ROLLED_OVER_TOTAL, &[], report.closed as u64);
    }
    Ok(report)
}

/// Remove stale device sightings once, then refresh the online gauge
pub async fn run_device_sweep(devices: Arc<DeviceTracker>) -> Result<usize> {
    blocking(move || {
        let now = Utc::now();
        let removed = devices.sweep_stale(now)?;
        devices.all_device_counts(now)?;
        Ok(removed)
    })
    .await
}

/// Running sweep loop; stops on `stop()` or when dropped
pub struct Scheduler {
    shutdown_tx: mpsc::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    pub fn start(
        periods: Arc<PeriodManager>,
        devices: Arc<DeviceTracker>,
        metrics: Arc<dyn MetricsSink>,
        config: &JobsConfig,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let period_every = Duration::from_secs(config.period_sweep_interval_secs);
        let device_every = Duration::from_secs(config.device_sweep_interval_secs);

        let handle = tokio::spawn(async move {
            let mut period_ticker = tokio::time::interval(period_every);
            period_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut device_ticker = tokio::time::interval(device_every);
            device_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = period_ticker.tick() => {
                        if let Err(e) = run_period_sweep(Arc::clone(&periods), Arc::clone(&metrics)).await {
                            error!(error = %e, "Period sweep failed");
                        }
                    }
                    _ = device_ticker.tick() => {
                        if let Err(e) = run_device_sweep(Arc::clone(&devices)).await {
                            error!(error = %e, "Device sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        });

        info!(
            period_sweep_secs = period_every.as_secs(),
            device_sweep_secs = device_every.as_secs(),
            "Scheduler started"
        );

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Finish the current sweep, then exit
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures;
    use crate::metrics::InMemoryMetrics;
    use crate::models::PeriodBounds;
    use crate::period::PeriodCalendar;
    use crate::store::SqliteStore;

    struct Fixture {
        store: Arc<SqliteStore>,
        periods: Arc<PeriodManager>,
        devices: Arc<DeviceTracker>,
        metrics: Arc<InMemoryMetrics>,
    }

    /// One subscriber whose period ended yesterday and one stale sighting
    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.put_plan(&fixtures::plan(1, 1_000, vec![1])).unwrap();
        store.put_subscriber(&fixtures::subscriber(1, Some(1))).unwrap();

        let now = Utc::now();
        let past = PeriodBounds {
            start: now - chrono::Duration::days(31),
            end: now - chrono::Duration::days(1),
        };
        store
            .transaction("seed", Duration::from_secs(1), |l| {
                l.insert_period(1, 1, past)?;
                l.upsert_device(1, 1, "1.1.1.1", now - chrono::Duration::hours(1))
            })
            .unwrap();

        let metrics = Arc::new(InMemoryMetrics::new());
        let timeout = Duration::from_secs(1);
        let periods = Arc::new(PeriodManager::new(
            PeriodCalendar::utc(),
            Arc::clone(&store),
            store.clone(),
            timeout,
        ));
        let devices = Arc::new(DeviceTracker::new(
            Arc::clone(&store),
            metrics.clone(),
            Duration::from_secs(300),
            timeout,
        ));

        Fixture {
            store,
            periods,
            devices,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_single_sweeps() {
        let f = fixture();

        let report = run_period_sweep(Arc::clone(&f.periods), f.metrics.clone())
            .await
            .unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(report.reopened, 1);
        assert_eq!(f.metrics.counter(names::PERIODS_ROLLED_OVER_TOTAL, &[]), 1);

        let current = f.store.read(|l| l.current_period(1)).unwrap().unwrap();
        assert!(current.bounds.contains(Utc::now()));

        assert_eq!(run_device_sweep(Arc::clone(&f.devices)).await.unwrap(), 1);
        assert_eq!(f.metrics.gauge(names::ONLINE_DEVICES, &[]), Some(0.0));
    }

    #[tokio::test]
    async fn test_scheduler_runs_sweeps_on_start() {
        let f = fixture();
        let scheduler = Scheduler::start(
            Arc::clone(&f.periods),
            Arc::clone(&f.devices),
            f.metrics.clone(),
            &JobsConfig::default(),
        );

        // Intervals fire immediately on their first tick
        let mut rolled = false;
        for _ in 0..200 {
            if f.metrics.counter(names::PERIODS_ROLLED_OVER_TOTAL, &[]) == 1
                && f.metrics.counter(names::STALE_DEVICES_REMOVED_TOTAL, &[]) == 1
            {
                rolled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;

        assert!(rolled, "sweeps did not run");
        assert_eq!(f.store.read(|l| l.count_current_periods(1)).unwrap(), 1);
    }
}
