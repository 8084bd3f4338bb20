//! Background maintenance.
//!
//! Periodically purges expired sessions, expired in-memory counters and
//! stale behavior history so that long-running processes stay bounded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

#[cfg(feature = "async")]
use tokio::sync::oneshot;
#[cfg(feature = "async")]
use tokio::task::JoinHandle;

/// Error returned when maintenance configuration validation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaintenanceConfigError {
    /// Maintenance interval must be greater than zero
    #[error("maintenance interval must be greater than 0")]
    ZeroInterval,
}

/// Configuration for the maintenance worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often to run a maintenance pass
    pub interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl MaintenanceConfig {
    /// Create a new maintenance config with the specified interval.
    ///
    /// # Errors
    /// Returns `MaintenanceConfigError::ZeroInterval` if `interval` is zero.
    pub fn new(interval: Duration) -> Result<Self, MaintenanceConfigError> {
        let config = Self { interval };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MaintenanceConfigError> {
        if self.interval.is_zero() {
            return Err(MaintenanceConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Expired sessions removed
    pub sessions: usize,
    /// Expired counters removed
    pub counters: usize,
    /// Stale behavior history keys removed
    pub history: usize,
}

impl MaintenanceReport {
    /// Total number of entries removed.
    pub fn total(&self) -> usize {
        self.sessions + self.counters + self.history
    }
}

/// Something that can be cleaned up periodically.
pub trait MaintenanceTask: Send + Sync {
    /// Run one maintenance pass.
    fn run_maintenance(&self) -> MaintenanceReport;
}

impl<T: MaintenanceTask + ?Sized> MaintenanceTask for std::sync::Arc<T> {
    fn run_maintenance(&self) -> MaintenanceReport {
        (**self).run_maintenance()
    }
}

/// Maintenance driven by request traffic.
///
/// Used when no background worker runs: callers ask [`InlineMaintenance::due`]
/// on the request path and run a pass when it answers `true`. At most one
/// caller per interval gets `true`.
#[derive(Debug)]
pub struct InlineMaintenance {
    interval_ms: i64,
    last_run_ms: AtomicI64,
}

impl InlineMaintenance {
    /// Schedule the first pass one `interval` after `now`.
    pub fn new(interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            last_run_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// Claim the pass for the current interval.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let last = self.last_run_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_run_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Error returned when stopping the maintenance worker fails.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The worker task panicked
    #[error("maintenance task panicked: {0}")]
    TaskPanicked(String),
    /// The worker task was cancelled before it could stop cleanly
    #[error("maintenance task was cancelled")]
    TaskCancelled,
}

/// Spawns the maintenance worker.
#[derive(Debug, Clone, Copy)]
pub struct Maintenance;

#[cfg(feature = "async")]
impl Maintenance {
    /// Start running `task` every `config.interval`.
    ///
    /// The first pass runs one interval after start. The worker keeps
    /// running until [`MaintenanceHandle::shutdown`] is called; dropping the
    /// handle does not stop it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T>(task: T, config: MaintenanceConfig) -> MaintenanceHandle
    where
        T: MaintenanceTask + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = config.interval;

        let join = tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Maintenance worker started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = task.run_maintenance();
                        if report.total() > 0 {
                            tracing::debug!(
                                sessions = report.sessions,
                                counters = report.counters,
                                history = report.history,
                                "Maintenance pass removed expired entries"
                            );
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Maintenance worker shutting down");
                        break;
                    }
                }
            }
        });

        MaintenanceHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a running maintenance worker.
#[cfg(feature = "async")]
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

#[cfg(feature = "async")]
impl MaintenanceHandle {
    /// Signal the worker to stop and wait for it to finish.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The receiver is gone only if the task already ended
            let _ = tx.send(());
        }
        self.join.await.map_err(|error| {
            if error.is_panic() {
                ShutdownError::TaskPanicked(error.to_string())
            } else {
                ShutdownError::TaskCancelled
            }
        })
    }

    /// Check if the worker task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_config_zero_interval() {
        assert_eq!(
            MaintenanceConfig::new(Duration::ZERO),
            Err(MaintenanceConfigError::ZeroInterval)
        );
        assert!(MaintenanceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inline_maintenance_due_once_per_interval() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let inline = InlineMaintenance::new(Duration::from_secs(60), start);

        assert!(!inline.due(start));
        assert!(!inline.due(start + chrono::Duration::seconds(59)));

        let later = start + chrono::Duration::seconds(60);
        assert!(inline.due(later));
        assert!(!inline.due(later));
        assert!(!inline.due(later + chrono::Duration::seconds(30)));
        assert!(inline.due(later + chrono::Duration::days(3)));
    }

    #[test]
    fn test_report_total() {
        let report = MaintenanceReport {
            sessions: 2,
            counters: 3,
            history: 1,
        };
        assert_eq!(report.total(), 6);
    }

    #[cfg(feature = "async")]
    mod worker {
        use super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        #[derive(Default)]
        struct CountingTask {
            runs: AtomicUsize,
        }

        impl MaintenanceTask for CountingTask {
            fn run_maintenance(&self) -> MaintenanceReport {
                self.runs.fetch_add(1, Ordering::SeqCst);
                MaintenanceReport {
                    sessions: 1,
                    ..MaintenanceReport::default()
                }
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_runs_every_interval() {
            let task = Arc::new(CountingTask::default());
            let handle = Maintenance::start(
                Arc::clone(&task),
                MaintenanceConfig::new(Duration::from_secs(10)).unwrap(),
            );

            tokio::time::sleep(Duration::from_secs(35)).await;
            assert_eq!(task.runs.load(Ordering::SeqCst), 3);

            handle.shutdown().await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn test_shutdown_stops_worker() {
            let task = Arc::new(CountingTask::default());
            let handle = Maintenance::start(
                Arc::clone(&task),
                MaintenanceConfig::new(Duration::from_secs(10)).unwrap(),
            );
            handle.shutdown().await.unwrap();

            tokio::time::sleep(Duration::from_secs(60)).await;
            assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        }

        struct PanickingTask;

        impl MaintenanceTask for PanickingTask {
            fn run_maintenance(&self) -> MaintenanceReport {
                panic!("maintenance failure");
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_panicking_task_reported_on_shutdown() {
            let handle = Maintenance::start(
                PanickingTask,
                MaintenanceConfig::new(Duration::from_secs(1)).unwrap(),
            );
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(handle.is_finished());
            assert!(matches!(
                handle.shutdown().await,
                Err(ShutdownError::TaskPanicked(_))
            ));
        }
    }
}
