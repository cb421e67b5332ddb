// THEORY:
// The `MetricsCollector` is the one piece of state shared by every concurrent
// analysis. It is built once by the caller, passed by `Arc` into the analyzer, and
// lives as long as the process does.
//
// Key architectural principles:
// 1.  **One Lock, One Step**: All counters and windows sit in a single
//     `MetricsState` behind one mutex. Every write and every read takes the lock once,
//     so nobody can observe half of an update or half of a reset. The lock is never
//     held across an `.await`.
// 2.  **Bounded Memory**: Histories are `RollingWindow`s. Old entries are evicted,
//     counters are not.
// 3.  **Derived on Read**: Averages and rates are computed from the raw state inside
//     `snapshot`, never stored, so they cannot drift from the counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::core_modules::detector::DetectorKind;
use crate::core_modules::rolling_window::RollingWindow;
use crate::core_modules::verdict::FatigueLabel;

/// One successful analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub prediction: FatigueLabel,
    pub confidence: f64,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// One failed analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Raw collector state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsState {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub prediction_distribution: BTreeMap<FatigueLabel, u64>,
    pub processing_times: RollingWindow<f64>,
    pub recent_errors: RollingWindow<ErrorRecord>,
    pub recent_outcomes: RollingWindow<OutcomeRecord>,
    /// Per-detector call durations in milliseconds.
    pub adapter_times: BTreeMap<DetectorKind, RollingWindow<f64>>,
    pub started_at: DateTime<Utc>,
}

impl MetricsState {
    fn new(config: &MetricsConfig) -> Self {
        Self {
            total: 0,
            successful: 0,
            failed: 0,
            prediction_distribution: BTreeMap::new(),
            processing_times: RollingWindow::new(config.processing_time_capacity),
            recent_errors: RollingWindow::new(config.error_capacity),
            recent_outcomes: RollingWindow::new(config.outcome_capacity),
            adapter_times: DetectorKind::ALL
                .iter()
                .map(|kind| (*kind, RollingWindow::new(config.adapter_time_capacity)))
                .collect(),
            started_at: Utc::now(),
        }
    }
}

/// A consistent copy of the state plus the values derived from it.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub state: MetricsState,
    pub average_processing_time_ms: f64,
    /// Percentage of failed analyses, 0 when nothing has been recorded.
    pub error_rate: f64,
    /// Percentage of successful analyses, 0 when nothing has been recorded.
    pub success_rate: f64,
    pub adapter_average_time_ms: BTreeMap<DetectorKind, f64>,
    #[serde(serialize_with = "serialize_seconds")]
    pub uptime: Duration,
}

fn serialize_seconds<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

/// How much happened recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecentActivity {
    pub successes: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            state: Mutex::new(MetricsState::new(&config)),
            config,
        }
    }

    // A panic elsewhere while holding the lock leaves every field valid, so the
    // poisoned state is used as-is.
    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self, prediction: FatigueLabel, confidence: f64, processing_time_ms: f64) {
        let mut state = self.lock();
        state.total += 1;
        state.successful += 1;
        *state.prediction_distribution.entry(prediction).or_insert(0) += 1;
        state.processing_times.push(processing_time_ms);
        state.recent_outcomes.push(OutcomeRecord {
            prediction,
            confidence,
            processing_time_ms,
            timestamp: Utc::now(),
        });
        drop(state);
        debug!(%prediction, confidence, processing_time_ms, "recorded analysis");
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock();
        state.total += 1;
        state.failed += 1;
        state.recent_errors.push(ErrorRecord {
            message: message.clone(),
            timestamp: Utc::now(),
        });
        drop(state);
        warn!(%message, "recorded analysis error");
    }

    /// Records how long one detector call took.
    pub fn record_adapter_time(&self, kind: DetectorKind, elapsed_ms: f64) {
        let capacity = self.config.adapter_time_capacity;
        self.lock()
            .adapter_times
            .entry(kind)
            .or_insert_with(|| RollingWindow::new(capacity))
            .push(elapsed_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock().clone();

        let rate = |count: u64| {
            if state.total == 0 {
                0.0
            } else {
                count as f64 / state.total as f64 * 100.0
            }
        };
        let error_rate = rate(state.failed);
        let success_rate = rate(state.successful);
        let adapter_average_time_ms = state
            .adapter_times
            .iter()
            .map(|(kind, window)| (*kind, window.mean()))
            .collect();
        let uptime = (Utc::now() - state.started_at).to_std().unwrap_or_default();

        MetricsSnapshot {
            average_processing_time_ms: state.processing_times.mean(),
            error_rate,
            success_rate,
            adapter_average_time_ms,
            uptime,
            state,
        }
    }

    pub fn adapter_average_time_ms(&self, kind: DetectorKind) -> f64 {
        self.lock()
            .adapter_times
            .get(&kind)
            .map(|window| window.mean())
            .unwrap_or(0.0)
    }

    /// Successes and errors recorded within the last `window`, as far back as the
    /// histories reach.
    pub fn recent_activity(&self, window: Duration) -> RecentActivity {
        let cutoff = match chrono::Duration::from_std(window) {
            Ok(span) => Utc::now() - span,
            Err(_) => DateTime::<Utc>::MIN_UTC,
        };
        let state = self.lock();
        RecentActivity {
            successes: state
                .recent_outcomes
                .iter()
                .filter(|outcome| outcome.timestamp >= cutoff)
                .count(),
            errors: state
                .recent_errors
                .iter()
                .filter(|error| error.timestamp >= cutoff)
                .count(),
        }
    }

    /// Clears every counter and window and restarts the uptime clock in one step.
    pub fn reset(&self) {
        *self.lock() = MetricsState::new(&self.config);
        debug!("metrics reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig {
            processing_time_capacity: 3,
            error_capacity: 2,
            outcome_capacity: 3,
            adapter_time_capacity: 2,
        })
    }

    #[test]
    fn totals_stay_consistent() {
        let metrics = small();
        for i in 0..7 {
            if i % 3 == 0 {
                metrics.record_error(format!("item {i} failed"));
            } else {
                metrics.record_success(FatigueLabel::Alert, 0.5, 10.0);
            }
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.state.total, 7);
        assert_eq!(snapshot.state.total, snapshot.state.successful + snapshot.state.failed);
        assert_eq!(snapshot.state.failed, 3);
        assert!((snapshot.error_rate - 300.0 / 7.0).abs() < 1e-9);
        assert!((snapshot.success_rate - 400.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn repeated_snapshots_agree() {
        let metrics = small();
        metrics.record_success(FatigueLabel::Drowsy, 0.4, 12.0);
        metrics.record_error("decode failed");

        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert_eq!(first.state, second.state);
        assert_eq!(first.average_processing_time_ms, second.average_processing_time_ms);
        assert_eq!(first.error_rate, second.error_rate);
        assert_eq!(first.adapter_average_time_ms, second.adapter_average_time_ms);
    }

    #[test]
    fn windows_evict_oldest_but_counters_keep_counting() {
        let metrics = small();
        for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
            metrics.record_success(FatigueLabel::Sleeping, 0.9, ms);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.state.successful, 5);
        assert_eq!(snapshot.state.processing_times.to_vec(), vec![3.0, 4.0, 5.0]);
        assert_eq!(snapshot.average_processing_time_ms, 4.0);
        assert_eq!(snapshot.state.prediction_distribution[&FatigueLabel::Sleeping], 5);
    }

    #[test]
    fn empty_collector_reports_zero_rates() {
        let snapshot = small().snapshot();
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.average_processing_time_ms, 0.0);
    }

    #[test]
    fn adapter_times_average_per_kind() {
        let metrics = small();
        metrics.record_adapter_time(DetectorKind::Landmark, 10.0);
        metrics.record_adapter_time(DetectorKind::Landmark, 20.0);
        metrics.record_adapter_time(DetectorKind::Landmark, 30.0);
        assert_eq!(metrics.adapter_average_time_ms(DetectorKind::Landmark), 25.0);
        assert_eq!(metrics.adapter_average_time_ms(DetectorKind::Cascade), 0.0);
    }

    #[test]
    fn recent_activity_counts_entries_in_window() {
        let metrics = small();
        metrics.record_success(FatigueLabel::Alert, 0.8, 5.0);
        metrics.record_error("fetch failed");
        let activity = metrics.recent_activity(Duration::from_secs(300));
        assert_eq!(activity, RecentActivity { successes: 1, errors: 1 });
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = small();
        metrics.record_success(FatigueLabel::Alert, 0.8, 5.0);
        metrics.record_error("boom");
        metrics.record_adapter_time(DetectorKind::Cascade, 3.0);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.state.total, 0);
        assert!(snapshot.state.prediction_distribution.is_empty());
        assert!(snapshot.state.recent_errors.is_empty());
        assert!(snapshot.state.recent_outcomes.is_empty());
        assert_eq!(snapshot.adapter_average_time_ms[&DetectorKind::Cascade], 0.0);
    }

    #[test]
    fn concurrent_writers_keep_totals_exact() {
        let metrics = Arc::new(MetricsCollector::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        if (worker + i) % 5 == 0 {
                            metrics.record_error("failed");
                        } else {
                            metrics.record_success(FatigueLabel::Drowsy, 0.6, 1.0);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.state.total, 400);
        assert_eq!(snapshot.state.successful + snapshot.state.failed, 400);
    }

    #[test]
    fn snapshot_serializes_distribution_by_label_name() {
        let metrics = small();
        metrics.record_success(FatigueLabel::Drowsy, 0.6, 1.0);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["prediction_distribution"]["drowsy"], 1);
        assert_eq!(json["total"], 1);
    }
}
