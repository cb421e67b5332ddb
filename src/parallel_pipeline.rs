// THEORY:
// The `parallel_pipeline` module runs many single-photo analyses at once. Every item
// of a batch is queued up front; a fixed pool of worker tasks drains the queue, one
// item at a time each, and reports back over a result channel. The pool size is the
// concurrency cap, so at most `concurrency_limit` analyses are ever in flight.
//
// Key architectural principles:
// 1.  **Tagged Outcomes**: A worker never lets an item fail by unwinding. Each item
//     yields an `ItemReport` carrying its batch position, its id and either an
//     outcome or a `ProcessingError`. Panics and timeouts are captured per item.
// 2.  **No Sibling Cancellation**: A failed or stuck item only affects its own report.
//     The other workers keep draining the queue.
// 3.  **Completion Order, Stable Identity**: Reports arrive in completion order. Every
//     report keeps its `item_id`, and the batch position is used to prove that each
//     input appears in exactly one of the two result lists.

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::core_modules::metrics::MetricsSnapshot;
use crate::error::{AnalysisError, ProcessingError, panic_message};
use crate::pipeline::{AnalysisOutcome, FatigueAnalyzer};

/// One item that could not be analysed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub item_id: String,
    pub error: String,
}

/// Everything a batch produced. Every input item is in exactly one of the two lists.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Completion order.
    pub successes: Vec<AnalysisOutcome>,
    /// Completion order.
    pub failures: Vec<BatchFailure>,
    pub total_count: usize,
    pub elapsed_ms: f64,
}

enum ItemInput {
    Bytes(Vec<u8>),
    Source(String),
}

struct ItemTask {
    position: usize,
    item_id: String,
    input: ItemInput,
}

struct ItemReport {
    position: usize,
    item_id: String,
    result: Result<AnalysisOutcome, ProcessingError>,
}

/// A per-batch pool of workers sharing one task queue.
struct WorkerPool {
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(
        analyzer: Arc<FatigueAnalyzer>,
        worker_count: usize,
        item_timeout: Option<Duration>,
        task_receiver: mpsc::UnboundedReceiver<ItemTask>,
        report_sender: mpsc::UnboundedSender<ItemReport>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(task_receiver));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let analyzer = Arc::clone(&analyzer);
                let queue = Arc::clone(&queue);
                let report_sender = report_sender.clone();

                tokio::spawn(async move {
                    loop {
                        let next = queue.lock().await.recv().await;
                        let Some(task) = next else { break };

                        debug!(worker_id, item_id = %task.item_id, "worker picked up item");
                        let result = Self::run_item(&analyzer, &task, item_timeout).await;
                        let report = ItemReport {
                            position: task.position,
                            item_id: task.item_id,
                            result,
                        };
                        if report_sender.send(report).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self { workers }
    }

    async fn run_item(
        analyzer: &FatigueAnalyzer,
        task: &ItemTask,
        item_timeout: Option<Duration>,
    ) -> Result<AnalysisOutcome, ProcessingError> {
        let analysis = async {
            match &task.input {
                ItemInput::Bytes(bytes) => analyzer.analyze(&task.item_id, bytes).await,
                ItemInput::Source(reference) => analyzer.analyze_source(&task.item_id, reference).await,
            }
        };
        let guarded = AssertUnwindSafe(analysis).catch_unwind();

        let caught = match item_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => caught,
                Err(_) => return Err(Self::fail(analyzer, &task.item_id, AnalysisError::TimedOut(limit))),
            },
            None => guarded.await,
        };

        caught.unwrap_or_else(|payload| {
            let cause = AnalysisError::Panicked(panic_message(payload.as_ref()));
            Err(Self::fail(analyzer, &task.item_id, cause))
        })
    }

    // The analyzer records its own outcomes; these failures never reached it.
    fn fail(analyzer: &FatigueAnalyzer, item_id: &str, cause: AnalysisError) -> ProcessingError {
        let error = ProcessingError::new(item_id, cause);
        analyzer.metrics().record_error(error.to_string());
        warn!(%error, "item abandoned");
        error
    }

    async fn join(self) {
        for joined in join_all(self.workers).await {
            if let Err(error) = joined {
                warn!(%error, "batch worker terminated abnormally");
            }
        }
    }
}

/// Runs batches of photos through a shared `FatigueAnalyzer` under a concurrency cap.
pub struct BatchOrchestrator {
    analyzer: Arc<FatigueAnalyzer>,
    item_timeout: Option<Duration>,
}

impl BatchOrchestrator {
    pub fn new(analyzer: Arc<FatigueAnalyzer>) -> Self {
        let item_timeout = analyzer.config().item_timeout();
        Self {
            analyzer,
            item_timeout,
        }
    }

    pub fn with_item_timeout(mut self, item_timeout: Option<Duration>) -> Self {
        self.item_timeout = item_timeout;
        self
    }

    /// The configured default concurrency limit.
    pub fn default_limit(&self) -> usize {
        self.analyzer.config().concurrency_limit
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.analyzer.metrics_snapshot()
    }

    pub fn adapters_ready(&self) -> std::collections::BTreeMap<&'static str, bool> {
        self.analyzer.adapters_ready()
    }

    /// Analyses `(item_id, image_bytes)` pairs with at most `concurrency_limit` in flight.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn run_batch(&self, items: Vec<(String, Vec<u8>)>, concurrency_limit: usize) -> BatchOutcome {
        let tasks = items
            .into_iter()
            .enumerate()
            .map(|(position, (item_id, bytes))| ItemTask {
                position,
                item_id,
                input: ItemInput::Bytes(bytes),
            })
            .collect();
        self.run_tasks(tasks, concurrency_limit).await
    }

    /// Fetches and analyses `(item_id, source_reference)` pairs with at most
    /// `concurrency_limit` in flight.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn run_batch_from_sources(
        &self,
        items: Vec<(String, String)>,
        concurrency_limit: usize,
    ) -> BatchOutcome {
        let tasks = items
            .into_iter()
            .enumerate()
            .map(|(position, (item_id, reference))| ItemTask {
                position,
                item_id,
                input: ItemInput::Source(reference),
            })
            .collect();
        self.run_tasks(tasks, concurrency_limit).await
    }

    async fn run_tasks(&self, tasks: Vec<ItemTask>, concurrency_limit: usize) -> BatchOutcome {
        let started = Instant::now();
        let total_count = tasks.len();

        if concurrency_limit == 0 {
            warn!("concurrency limit of 0 requested, running one item at a time");
        }
        let worker_count = concurrency_limit.max(1).min(total_count);

        // Identity of every queued item, cleared as reports come in.
        let mut pending: Vec<Option<String>> =
            tasks.iter().map(|task| Some(task.item_id.clone())).collect();

        let (task_sender, task_receiver) = mpsc::unbounded_channel();
        let (report_sender, mut report_receiver) = mpsc::unbounded_channel();
        for task in tasks {
            // The receiver is alive until the pool is spawned below.
            let _ = task_sender.send(task);
        }
        drop(task_sender);

        let pool = WorkerPool::spawn(
            Arc::clone(&self.analyzer),
            worker_count,
            self.item_timeout,
            task_receiver,
            report_sender,
        );

        let mut successes = Vec::with_capacity(total_count);
        let mut failures = Vec::new();
        while let Some(report) = report_receiver.recv().await {
            if let Some(slot) = pending.get_mut(report.position) {
                *slot = None;
            }
            match report.result {
                Ok(outcome) => successes.push(outcome),
                Err(error) => failures.push(BatchFailure {
                    item_id: report.item_id,
                    error: error.cause.to_string(),
                }),
            }
        }
        pool.join().await;

        // Anything still pending belonged to a worker that died mid-item.
        for item_id in pending.into_iter().flatten() {
            let error = ProcessingError::new(
                item_id.as_str(),
                AnalysisError::Panicked("batch worker terminated".to_string()),
            );
            self.analyzer.metrics().record_error(error.to_string());
            failures.push(BatchFailure {
                item_id,
                error: error.cause.to_string(),
            });
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            total_count,
            successes = successes.len(),
            failures = failures.len(),
            elapsed_ms,
            "batch complete"
        );

        BatchOutcome {
            successes,
            failures,
            total_count,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core_modules::metrics::MetricsCollector;
    use crate::core_modules::providers::ImageSource;
    use crate::error::FetchError;
    use crate::pipeline::tests::{PanickingSink, alert_analyzer, png};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orchestrator(metrics: Arc<MetricsCollector>) -> BatchOrchestrator {
        BatchOrchestrator::new(Arc::new(alert_analyzer(metrics)))
    }

    /// Counts how many fetches are in flight at once.
    #[derive(Default)]
    struct GaugedSource {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ImageSource for GaugedSource {
        async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match reference {
                "hang" => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                "panic" => panic!("source exploded"),
                _ => Ok(png(32, 32)),
            }
        }
    }

    #[tokio::test]
    async fn failing_items_are_isolated_and_identified() {
        let metrics = Arc::new(MetricsCollector::default());
        let batch = orchestrator(metrics.clone());

        let items: Vec<_> = (0..10)
            .map(|i| {
                let bytes = if i == 2 || i == 7 { b"garbage".to_vec() } else { png(48, 48) };
                (format!("item-{i}"), bytes)
            })
            .collect();

        let outcome = batch.run_batch(items, 3).await;

        assert_eq!(outcome.total_count, 10);
        assert_eq!(outcome.successes.len(), 8);
        let failed: HashSet<_> = outcome.failures.iter().map(|f| f.item_id.as_str()).collect();
        assert_eq!(failed, HashSet::from(["item-2", "item-7"]));

        let succeeded: HashSet<_> = outcome.successes.iter().map(|s| s.item_id.clone()).collect();
        let expected: HashSet<_> = (0..10)
            .filter(|i| *i != 2 && *i != 7)
            .map(|i| format!("item-{i}"))
            .collect();
        assert_eq!(succeeded, expected);

        let snapshot = metrics.snapshot();
        assert_eq!((snapshot.state.successful, snapshot.state.failed), (8, 2));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let source = Arc::new(GaugedSource::default());
        let analyzer = alert_analyzer(Arc::new(MetricsCollector::default())).with_source(source.clone());
        let batch = BatchOrchestrator::new(Arc::new(analyzer));

        let items = (0..20).map(|i| (format!("item-{i}"), format!("ref-{i}"))).collect();
        let outcome = batch.run_batch_from_sources(items, 5).await;

        assert_eq!(outcome.successes.len(), 20);
        let peak = source.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak concurrency was {peak}");
        assert!(peak > 1, "items never overlapped");
    }

    #[tokio::test]
    async fn zero_limit_runs_serially() {
        let source = Arc::new(GaugedSource::default());
        let analyzer = alert_analyzer(Arc::new(MetricsCollector::default())).with_source(source.clone());
        let batch = BatchOrchestrator::new(Arc::new(analyzer));

        let items = (0..4).map(|i| (format!("item-{i}"), format!("ref-{i}"))).collect();
        let outcome = batch.run_batch_from_sources(items, 0).await;

        assert_eq!(outcome.successes.len(), 4);
        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stuck_item_times_out_without_blocking_siblings() {
        let metrics = Arc::new(MetricsCollector::default());
        let analyzer = alert_analyzer(metrics.clone()).with_source(Arc::new(GaugedSource::default()));
        let batch = BatchOrchestrator::new(Arc::new(analyzer))
            .with_item_timeout(Some(Duration::from_millis(200)));

        let items = vec![
            ("slow".to_string(), "hang".to_string()),
            ("a".to_string(), "ref-a".to_string()),
            ("b".to_string(), "ref-b".to_string()),
        ];
        let outcome = batch.run_batch_from_sources(items, 2).await;

        assert_eq!(outcome.successes.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item_id, "slow");
        assert!(outcome.failures[0].error.contains("timed out"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.state.total, 3);
        assert_eq!(snapshot.state.failed, 1);
    }

    #[tokio::test]
    async fn panicking_item_becomes_failure_entry() {
        let metrics = Arc::new(MetricsCollector::default());
        let analyzer = alert_analyzer(metrics.clone()).with_source(Arc::new(GaugedSource::default()));
        let batch = BatchOrchestrator::new(Arc::new(analyzer));

        let items = vec![
            ("boom".to_string(), "panic".to_string()),
            ("fine".to_string(), "ref".to_string()),
        ];
        let outcome = batch.run_batch_from_sources(items, 2).await;

        assert_eq!(outcome.successes.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item_id, "boom");
        assert!(outcome.failures[0].error.contains("source exploded"));
        assert_eq!(metrics.snapshot().state.total, 2);
    }

    #[tokio::test]
    async fn panicking_sink_does_not_turn_success_into_failure() {
        let metrics = Arc::new(MetricsCollector::default());
        let analyzer = alert_analyzer(metrics.clone()).with_sink(Arc::new(PanickingSink));
        let batch = BatchOrchestrator::new(Arc::new(analyzer));

        let outcome = batch.run_batch(vec![("only".to_string(), png(48, 48))], 1).await;

        assert_eq!(outcome.successes.len(), 1);
        assert!(outcome.failures.is_empty());
        let snapshot = metrics.snapshot();
        assert_eq!(
            (snapshot.state.total, snapshot.state.successful, snapshot.state.failed),
            (1, 1, 0)
        );
    }

    #[tokio::test]
    async fn empty_batch_is_well_formed() {
        let batch = orchestrator(Arc::new(MetricsCollector::default()));
        let outcome = batch.run_batch(Vec::new(), 5).await;
        assert_eq!(outcome.total_count, 0);
        assert!(outcome.successes.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn whole_batch_failing_still_returns_outcome() {
        let batch = orchestrator(Arc::new(MetricsCollector::default()));
        let items = (0..5).map(|i| (format!("bad-{i}"), Vec::new())).collect();
        let outcome = batch.run_batch(items, 2).await;
        assert_eq!(outcome.failures.len(), 5);
        assert_eq!(outcome.successes.len() + outcome.failures.len(), outcome.total_count);
    }

    #[test]
    fn default_limit_comes_from_config() {
        let analyzer = alert_analyzer(Arc::new(MetricsCollector::default()));
        let batch = BatchOrchestrator::new(Arc::new(analyzer));
        assert_eq!(batch.default_limit(), EngineConfig::default().concurrency_limit);
    }
}
