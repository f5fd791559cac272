//! Watchdog paired with one engine.
//!
//! The monitor probes the engine at a fixed interval and reports liveness
//! transitions to the coordinator. It never touches station state itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("engine answered PROBE_KO")]
    Ko,
    #[error("probe timed out")]
    Timeout,
    #[error("probe connection failed: {0}")]
    Connection(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReportError {
    #[error("coordinator unreachable: {0}")]
    Unreachable(String),
    #[error("coordinator rejected report: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// Where liveness transitions are sent.
#[async_trait]
pub trait LivenessReporter: Send + Sync {
    async fn station_down(&self, station_id: &str) -> Result<(), ReportError>;
    async fn station_up(&self, station_id: &str) -> Result<(), ReportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub down_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(2000),
            failure_threshold: 3,
            down_backoff: Duration::from_millis(3000),
        }
    }
}

/// Counts consecutive probe failures.
///
/// `record_*` only return the report that is due; the down flag changes when
/// the caller [`confirm`](FailureDetector::confirm)s the report was delivered,
/// so an undelivered report is produced again on the next probe.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    threshold: u32,
    consecutive_failures: u32,
    down: bool,
}

impl FailureDetector {
    pub fn new(threshold: u32) -> Self {
        FailureDetector {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            down: false,
        }
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) -> Option<Liveness> {
        self.consecutive_failures = 0;
        self.down.then_some(Liveness::Up)
    }

    pub fn record_failure(&mut self) -> Option<Liveness> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        (!self.down && self.consecutive_failures >= self.threshold).then_some(Liveness::Down)
    }

    pub fn confirm(&mut self, report: Liveness) {
        self.down = report == Liveness::Down;
    }
}

pub struct StationMonitor {
    station_id: String,
    config: MonitorConfig,
    prober: Arc<dyn Prober>,
    reporter: Arc<dyn LivenessReporter>,
    detector: FailureDetector,
}

impl StationMonitor {
    pub fn new(
        station_id: impl Into<String>,
        config: MonitorConfig,
        prober: Arc<dyn Prober>,
        reporter: Arc<dyn LivenessReporter>,
    ) -> Self {
        StationMonitor {
            station_id: station_id.into(),
            config,
            prober,
            reporter,
            detector: FailureDetector::new(config.failure_threshold),
        }
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// Runs one probe and delivers any report it makes due.
    pub async fn probe_once(&mut self) -> Option<Liveness> {
        let outcome = match tokio::time::timeout(self.config.probe_timeout, self.prober.probe()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::Timeout),
        };

        let due = match outcome {
            Ok(()) => self.detector.record_success(),
            Err(error) => {
                tracing::debug!(
                    station_id = %self.station_id,
                    failures = self.detector.consecutive_failures() + 1,
                    error = %error,
                    "probe failed"
                );
                self.detector.record_failure()
            }
        };
        let report = due?;

        let delivered = match report {
            Liveness::Down => self.reporter.station_down(&self.station_id).await,
            Liveness::Up => self.reporter.station_up(&self.station_id).await,
        };
        match delivered {
            Ok(()) => {
                self.detector.confirm(report);
                match report {
                    Liveness::Down => tracing::warn!(station_id = %self.station_id, "station reported down"),
                    Liveness::Up => tracing::info!(station_id = %self.station_id, "station reported up"),
                }
                Some(report)
            }
            Err(error) => {
                tracing::warn!(
                    station_id = %self.station_id,
                    report = ?report,
                    error = %error,
                    "liveness report not delivered, retrying on next probe"
                );
                None
            }
        }
    }

    /// Probes until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(station_id = %self.station_id, "monitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.probe_once().await;

            let pause = if self.detector.is_down() {
                self.config.down_backoff
            } else {
                self.config.probe_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(station_id = %self.station_id, "monitor stopped");
    }
}
