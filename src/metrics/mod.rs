//! Connection Metrics
//!
//! Producers (connection tasks, the tunnel controller) append to a pending
//! buffer; a background task folds that buffer into the aggregate every
//! `interval`. The flush is the only writer of the aggregate, and readers
//! copy it under the same lock, so a snapshot never observes half a flush.

mod history;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MetricsConfig;
use history::DurationHistory;

/// Maximum number of error kind-names kept in the aggregate
pub const MAX_STORED_ERRORS: usize = 1000;

/// Static labels attached to every snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsLabels {
    pub host: String,
    pub port: String,
    /// `ssh` or `tcp`
    pub connection_type: String,
    /// SSH host, or `n/a` in plain mode
    pub ssh_host: String,
}

impl MetricsLabels {
    pub fn new(host: &str, port: u16, ssh_host: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            port: port.to_string(),
            connection_type: if ssh_host.is_some() { "ssh" } else { "tcp" }.to_string(),
            ssh_host: ssh_host.unwrap_or("n/a").to_string(),
        }
    }
}

/// Statistics over the most recently flushed batch of durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub mean: f64,
    pub max: f64,
    pub count: usize,
}

/// Point-in-time copy of the aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_connections: i64,
    pub rejected_connections_total: u64,
    pub ssh_reconnects_total: u64,
    pub ssh_reconnect_successes_total: u64,
    /// Recent: arrival order. Outliers: largest first.
    pub connection_durations: Vec<f64>,
    pub connection_stats: ConnectionStats,
    pub connection_errors: Vec<String>,
    pub uptime_seconds: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics_task_restarts: u32,
    pub labels: MetricsLabels,
}

#[derive(Debug, Default)]
struct PendingMetrics {
    total: u64,
    active_delta: i64,
    rejected: u64,
    reconnects: u64,
    reconnect_successes: u64,
    durations: Vec<f64>,
    errors: Vec<String>,
}

#[derive(Debug)]
struct Aggregate {
    connections_total: u64,
    active_connections: i64,
    rejected_connections_total: u64,
    ssh_reconnects_total: u64,
    ssh_reconnect_successes_total: u64,
    durations: DurationHistory,
    stats: ConnectionStats,
    errors: Vec<String>,
}

impl Aggregate {
    fn new(config: &MetricsConfig) -> Self {
        Self {
            connections_total: 0,
            active_connections: 0,
            rejected_connections_total: 0,
            ssh_reconnects_total: 0,
            ssh_reconnect_successes_total: 0,
            durations: DurationHistory::new(config.retention_strategy, config.max_durations),
            stats: ConnectionStats::default(),
            errors: Vec::new(),
        }
    }
}

struct MetricsInner {
    aggregate: Aggregate,
    pending: PendingMetrics,
    labels: MetricsLabels,
    started: Option<(Instant, DateTime<Utc>)>,
    spawns: u32,
}

impl MetricsInner {
    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let agg = &mut self.aggregate;

        agg.connections_total += pending.total;
        agg.active_connections += pending.active_delta;
        agg.rejected_connections_total += pending.rejected;
        agg.ssh_reconnects_total += pending.reconnects;
        agg.ssh_reconnect_successes_total += pending.reconnect_successes;

        if !pending.durations.is_empty() {
            let count = pending.durations.len();
            let sum: f64 = pending.durations.iter().sum();
            let max = pending.durations.iter().copied().fold(f64::MIN, f64::max);
            agg.stats = ConnectionStats {
                mean: sum / count as f64,
                max,
                count,
            };
            agg.durations.extend(pending.durations);
        }

        if !pending.errors.is_empty() {
            agg.errors.extend(pending.errors);
            if agg.errors.len() > MAX_STORED_ERRORS {
                let excess = agg.errors.len() - MAX_STORED_ERRORS;
                agg.errors.drain(..excess);
            }
        }
    }
}

struct FlushTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Aggregates connection, rejection and reconnect events.
pub struct MetricsAggregator {
    config: MetricsConfig,
    inner: Arc<Mutex<MetricsInner>>,
    task: Mutex<Option<FlushTask>>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig, labels: MetricsLabels) -> Self {
        let inner = MetricsInner {
            aggregate: Aggregate::new(&config),
            pending: PendingMetrics::default(),
            labels,
            started: None,
            spawns: 0,
        };
        Self {
            config,
            inner: Arc::new(Mutex::new(inner)),
            task: Mutex::new(None),
        }
    }

    /// Record the start time and spawn the flush loop if it is not running.
    pub fn start(&self) {
        {
            let mut inner = self.inner.lock();
            inner.started = Some((Instant::now(), Utc::now()));
        }

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        self.inner.lock().spawns += 1;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(flush_loop(
            self.inner.clone(),
            self.config.interval(),
            cancel.clone(),
        ));
        *task = Some(FlushTask { cancel, handle });
        debug!("Metrics flush task started ({:?} interval)", self.config.interval());
    }

    /// Cancel the flush loop and wait for it to exit. Safe if never started.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            debug!("Metrics flush task ended abnormally: {}", e);
        }
        debug!("Metrics flush task stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.cancel.is_cancelled() && !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Close out a connection previously counted by `record_admission`.
    pub fn record_connection(&self, duration: Duration, error_kinds: Vec<String>) {
        let mut inner = self.inner.lock();
        inner.pending.total += 1;
        inner.pending.active_delta -= 1;
        inner.pending.durations.push(duration.as_secs_f64());
        inner.pending.errors.extend(error_kinds);
    }

    /// A connection passed admission and now occupies a slot.
    pub fn record_admission(&self) {
        self.inner.lock().pending.active_delta += 1;
    }

    pub fn record_rejection(&self) {
        self.inner.lock().pending.rejected += 1;
    }

    pub fn record_reconnect(&self, success: bool) {
        let mut inner = self.inner.lock();
        inner.pending.reconnects += 1;
        if success {
            inner.pending.reconnect_successes += 1;
        }
    }

    /// Fold the pending buffer into the aggregate right away.
    pub fn flush_now(&self) {
        self.inner.lock().flush();
    }

    /// Update the port label once an ephemeral port has been assigned.
    pub fn set_port(&self, port: u16) {
        self.inner.lock().labels.port = port.to_string();
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let agg = &inner.aggregate;
        MetricsSnapshot {
            connections_total: agg.connections_total,
            active_connections: agg.active_connections,
            rejected_connections_total: agg.rejected_connections_total,
            ssh_reconnects_total: agg.ssh_reconnects_total,
            ssh_reconnect_successes_total: agg.ssh_reconnect_successes_total,
            connection_durations: agg.durations.to_vec(),
            connection_stats: agg.stats,
            connection_errors: agg.errors.clone(),
            uptime_seconds: inner
                .started
                .map(|(at, _)| at.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            started_at: inner.started.map(|(_, wall)| wall),
            metrics_task_restarts: inner.spawns.saturating_sub(1),
            labels: inner.labels.clone(),
        }
    }

    pub fn reset_metrics(&self) {
        let mut inner = self.inner.lock();
        inner.aggregate = Aggregate::new(&self.config);
        inner.pending = PendingMetrics::default();
        inner.started = Some((Instant::now(), Utc::now()));
        info!("Metrics reset successfully");
    }
}

async fn flush_loop(inner: Arc<Mutex<MetricsInner>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.lock().flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionStrategy;

    fn aggregator(max_durations: usize, strategy: RetentionStrategy) -> MetricsAggregator {
        let config = MetricsConfig {
            interval: 0.05,
            max_durations,
            retention_strategy: strategy,
        };
        MetricsAggregator::new(config, MetricsLabels::new("localhost", 0, None))
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_recent_retention_evicts_oldest() {
        let metrics = aggregator(2, RetentionStrategy::Recent);
        for d in [100, 200, 300] {
            metrics.record_connection(ms(d), vec![]);
            metrics.flush_now();
        }
        let snap = metrics.get_metrics();
        assert_eq!(snap.connection_durations, vec![0.2, 0.3]);
        assert_eq!(snap.connections_total, 3);
        assert_eq!(snap.connection_stats.count, 1);
        assert_eq!(snap.connection_stats.max, 0.3);
    }

    #[test]
    fn test_outlier_retention_keeps_largest() {
        let metrics = aggregator(2, RetentionStrategy::Outliers);
        for d in [50, 250, 150] {
            metrics.record_connection(ms(d), vec![]);
        }
        metrics.flush_now();
        let snap = metrics.get_metrics();
        assert_eq!(snap.connection_durations, vec![0.25, 0.15]);
        assert_eq!(snap.connection_stats.count, 3);
        assert!((snap.connection_stats.mean - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_outliers_across_flushes() {
        let metrics = aggregator(2, RetentionStrategy::Outliers);
        metrics.record_connection(ms(900), vec![]);
        metrics.flush_now();
        metrics.record_connection(ms(100), vec![]);
        metrics.record_connection(ms(500), vec![]);
        metrics.flush_now();
        assert_eq!(metrics.get_metrics().connection_durations, vec![0.9, 0.5]);
    }

    #[test]
    fn test_pending_invisible_until_flush() {
        let metrics = aggregator(10, RetentionStrategy::Recent);
        metrics.record_admission();
        metrics.record_rejection();
        metrics.record_reconnect(true);
        metrics.record_reconnect(false);

        let snap = metrics.get_metrics();
        assert_eq!(snap.rejected_connections_total, 0);
        assert_eq!(snap.active_connections, 0);

        metrics.flush_now();
        let snap = metrics.get_metrics();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.rejected_connections_total, 1);
        assert_eq!(snap.ssh_reconnects_total, 2);
        assert_eq!(snap.ssh_reconnect_successes_total, 1);

        metrics.record_connection(ms(10), vec!["ConnectionReset".into()]);
        metrics.flush_now();
        let snap = metrics.get_metrics();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.connection_errors, vec!["ConnectionReset".to_string()]);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let metrics = aggregator(10, RetentionStrategy::Recent);
        for i in 0..(MAX_STORED_ERRORS + 5) {
            metrics.record_connection(ms(1), vec![format!("E{}", i)]);
        }
        metrics.flush_now();
        let errors = metrics.get_metrics().connection_errors;
        assert_eq!(errors.len(), MAX_STORED_ERRORS);
        assert_eq!(errors[0], "E5");
    }

    #[test]
    fn test_reset_metrics() {
        let metrics = aggregator(10, RetentionStrategy::Recent);
        metrics.record_connection(ms(200), vec!["Other".into()]);
        metrics.record_rejection();
        metrics.flush_now();
        metrics.record_connection(ms(300), vec![]);

        metrics.reset_metrics();
        metrics.flush_now();
        let snap = metrics.get_metrics();
        assert_eq!(snap.connections_total, 0);
        assert_eq!(snap.rejected_connections_total, 0);
        assert!(snap.connection_durations.is_empty());
        assert!(snap.connection_errors.is_empty());
        assert!(snap.started_at.is_some());
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let metrics = aggregator(10, RetentionStrategy::Recent);
        metrics.record_connection(ms(200), vec![]);
        metrics.flush_now();
        let mut snap = metrics.get_metrics();
        snap.connection_durations.clear();
        assert_eq!(metrics.get_metrics().connection_durations.len(), 1);
    }

    #[test]
    fn test_labels() {
        let metrics = MetricsAggregator::new(
            MetricsConfig::default(),
            MetricsLabels::new("localhost", 0, Some("bastion")),
        );
        metrics.set_port(4242);
        let labels = metrics.get_metrics().labels;
        assert_eq!(labels.port, "4242");
        assert_eq!(labels.connection_type, "ssh");
        assert_eq!(labels.ssh_host, "bastion");
        assert_eq!(MetricsLabels::new("h", 1, None).ssh_host, "n/a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_loop_runs_on_interval() {
        let metrics = aggregator(10, RetentionStrategy::Recent);
        metrics.start();
        metrics.record_connection(ms(100), vec![]);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(metrics.get_metrics().connections_total, 1);

        metrics.stop().await;
        metrics.record_connection(ms(100), vec![]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(metrics.get_metrics().connections_total, 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_and_restart() {
        let metrics = aggregator(10, RetentionStrategy::Recent);
        metrics.stop().await;
        assert!(!metrics.is_running());

        metrics.start();
        metrics.start();
        assert!(metrics.is_running());
        assert_eq!(metrics.get_metrics().metrics_task_restarts, 0);

        metrics.stop().await;
        metrics.stop().await;
        assert!(!metrics.is_running());

        metrics.start();
        assert!(metrics.is_running());
        assert_eq!(metrics.get_metrics().metrics_task_restarts, 1);
        metrics.stop().await;
    }
}
