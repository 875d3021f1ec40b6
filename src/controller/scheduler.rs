//! Resync Scheduler
//!
//! Turns watch triggers and the periodic resync into reconcile calls:
//!
//! ```text
//!   pod events ──▶ fanout ──┐
//!   tracker events ─────────┼──▶ WorkQueue ──▶ N workers ──▶ Reconciler
//!   resync ticker ──────────┘        ▲              │
//!                                    └── backoff ◀──┘ (on error)
//! ```
//!
//! The queue holds each name at most once and never hands the same name to
//! two workers at a time. A name enqueued while in flight is parked and
//! requeued once the running reconcile finishes.

use crate::config::ControllerConfig;
use crate::controller::fanout::FanoutIndex;
use crate::controller::reconciler::Reconciler;
use crate::domain::deadline::with_deadline;
use crate::domain::ports::{TrackerStoreRef, TriggerEvent};
use crate::error::{ErrorAction, Result};
use crate::metrics::OperatorMetrics;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use indexmap::IndexSet;
use kube::ResourceExt;
use parking_lot::Mutex;
use prometheus::IntGauge;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Work Queue
// =============================================================================

#[derive(Default)]
struct QueueState {
    /// Names waiting for a worker, oldest first
    pending: IndexSet<String>,
    /// Names currently being reconciled
    in_flight: HashSet<String>,
    /// In-flight names that were enqueued again
    dirty: HashSet<String>,
    shutdown: bool,
}

/// Coalescing FIFO of tracker names
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    depth: Option<IntGauge>,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue that keeps `depth` equal to the number of pending names
    pub fn with_depth_gauge(depth: IntGauge) -> Arc<Self> {
        Arc::new(Self {
            depth: Some(depth),
            ..Default::default()
        })
    }

    fn publish_depth(&self, state: &QueueState) {
        if let Some(depth) = &self.depth {
            depth.set(state.pending.len() as i64);
        }
    }

    /// Enqueue a name; duplicates collapse into one entry
    pub fn add(&self, name: &str) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.in_flight.contains(name) {
            state.dirty.insert(name.to_string());
            return;
        }
        if state.pending.insert(name.to_string()) {
            self.publish_depth(&state);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a name once `delay` has passed, unless cancelled first
    pub fn add_after(self: &Arc<Self>, name: &str, delay: Duration, token: &CancellationToken) {
        let queue = self.clone();
        let name = name.to_string();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(&name),
            }
        });
    }

    /// Wait for the next name; `None` once shut down or cancelled
    pub async fn next(&self, token: &CancellationToken) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(name) = state.pending.shift_remove_index(0) {
                    state.in_flight.insert(name.clone());
                    self.publish_depth(&state);
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(name);
                }
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Mark a name handed out by [`WorkQueue::next`] as finished
    pub fn done(&self, name: &str) {
        let mut state = self.state.lock();
        state.in_flight.remove(name);
        if state.dirty.remove(name) && !state.shutdown {
            state.pending.insert(name.to_string());
            self.publish_depth(&state);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out names and wake every waiter
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Names waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a name is currently handed out
    pub fn is_in_flight(&self, name: &str) -> bool {
        self.state.lock().in_flight.contains(name)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives the reconciler from triggers, the resync ticker and retries
pub struct ResyncScheduler {
    reconciler: Arc<Reconciler>,
    fanout: FanoutIndex,
    trackers: TrackerStoreRef,
    queue: Arc<WorkQueue>,
    metrics: Arc<OperatorMetrics>,
    config: ControllerConfig,
    backoffs: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl ResyncScheduler {
    /// Create a new scheduler
    pub fn new(
        reconciler: Arc<Reconciler>,
        trackers: TrackerStoreRef,
        metrics: Arc<OperatorMetrics>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            fanout: FanoutIndex::new(trackers.clone(), config.call_timeout()),
            trackers,
            queue: WorkQueue::with_depth_gauge(metrics.queue_depth.clone()),
            metrics,
            config,
            backoffs: Mutex::new(HashMap::new()),
        })
    }

    /// The queue feeding the workers
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `token` is cancelled, then wait for every task to stop
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Receiver<TriggerEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        info!(
            "Starting resync scheduler: {} workers, resync every {:?}",
            self.config.workers,
            self.config.resync_interval()
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.workers + 2);
        tasks.push(tokio::spawn(self.clone().pump_events(events, token.clone())));
        tasks.push(tokio::spawn(self.clone().resync_loop(token.clone())));
        for id in 0..self.config.workers {
            tasks.push(tokio::spawn(self.clone().worker(id, token.clone())));
        }

        token.cancelled().await;
        self.queue.shutdown();

        for task in tasks {
            if let Err(e) = task.await {
                error!("Scheduler task failed: {}", e);
            }
        }
        info!("Resync scheduler stopped");
        Ok(())
    }

    /// Enqueue a tracker name
    pub fn enqueue(&self, name: &str) {
        self.queue.add(name);
    }

    /// Route one trigger to the queue
    pub async fn handle_event(&self, event: TriggerEvent) {
        match event {
            TriggerEvent::Pod(pod_event) => {
                for name in self.fanout.affected_trackers(&pod_event).await {
                    self.metrics.fanout_requests.inc();
                    self.enqueue(&name);
                }
            }
            TriggerEvent::Tracker(tracker_event) => {
                debug!(
                    "PodTracker {} {}, enqueueing",
                    tracker_event.object(),
                    tracker_event.kind()
                );
                self.enqueue(tracker_event.object());
            }
        }
    }

    /// Enqueue every existing tracker
    pub async fn resync(&self) -> Result<usize> {
        let trackers = with_deadline(
            self.config.call_timeout(),
            "list trackers",
            self.trackers.list_trackers(),
        )
        .await?;
        for tracker in &trackers {
            self.enqueue(&tracker.name_any());
        }
        Ok(trackers.len())
    }

    /// Reconcile one name and schedule a retry if it failed
    pub async fn process(&self, name: &str, token: &CancellationToken) {
        match self.reconciler.reconcile(name).await {
            Ok(outcome) => {
                self.metrics
                    .reconciles
                    .with_label_values(&[outcome.as_str()])
                    .inc();
                self.backoffs.lock().remove(name);
            }
            Err(e) => {
                self.metrics.reconcile_errors.inc();
                match e.action() {
                    ErrorAction::RequeueWithBackoff => {
                        let delay = self.next_delay(name);
                        warn!("Reconcile of {} failed: {}, retrying in {:?}", name, e, delay);
                        self.queue.add_after(name, delay, token);
                    }
                    ErrorAction::RequeueAfter(delay) => {
                        warn!("Reconcile of {} failed: {}, retrying in {:?}", name, e, delay);
                        self.queue.add_after(name, delay, token);
                    }
                    ErrorAction::NoRequeue => {
                        error!("Reconcile of {} failed permanently: {}", name, e);
                        self.backoffs.lock().remove(name);
                    }
                }
            }
        }
    }

    /// Next retry delay for a name, growing with consecutive failures
    fn next_delay(&self, name: &str) -> Duration {
        let mut backoffs = self.backoffs.lock();
        let backoff = backoffs
            .entry(name.to_string())
            .or_insert_with(|| retry_backoff(&self.config));
        backoff
            .next_backoff()
            .unwrap_or_else(|| self.config.retry_max_delay())
    }

    async fn pump_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TriggerEvent>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Trigger channel closed, relying on periodic resync");
                        break;
                    }
                },
            }
        }
    }

    async fn resync_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match self.resync().await {
                    Ok(count) => debug!("Resync enqueued {} trackers", count),
                    Err(e) => error!("Failed to list PodTrackers for resync: {}", e),
                },
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize, token: CancellationToken) {
        debug!("Reconcile worker {} started", id);
        while let Some(name) = self.queue.next(&token).await {
            self.process(&name, &token).await;
            self.queue.done(&name);
        }
        debug!("Reconcile worker {} stopped", id);
    }
}

fn retry_backoff(config: &ControllerConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.retry_initial_delay())
        .with_max_interval(config.retry_max_delay())
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ObservedPod, WatchEvent};
    use crate::domain::InMemoryCluster;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn scheduler(cluster: &Arc<InMemoryCluster>, config: ControllerConfig) -> Arc<ResyncScheduler> {
        let metrics = OperatorMetrics::new().unwrap();
        let reconciler = Arc::new(Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            metrics.clone(),
            &config,
        ));
        ResyncScheduler::new(reconciler, cluster.clone(), metrics, config)
    }

    fn addressed_pod(namespace: &str, name: &str, ip: &str) -> ObservedPod {
        ObservedPod {
            name: name.into(),
            namespace: namespace.into(),
            ip: ip.into(),
            node_name: Some("node-1".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_queue_coalesces_duplicates() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);

        let token = CancellationToken::new();
        assert_eq!(queue.next(&token).await.as_deref(), Some("a"));
        assert_eq!(queue.next(&token).await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_single_flight_per_name() {
        let queue = WorkQueue::new();
        let token = CancellationToken::new();
        queue.add("a");
        assert_eq!(queue.next(&token).await.as_deref(), Some("a"));

        // Re-enqueued while in flight: parked, not handed out
        queue.add("a");
        assert!(queue.is_in_flight("a"));
        assert!(queue.is_empty());
        let mut waiting = task::spawn(queue.next(&token));
        assert_pending!(waiting.poll());

        queue.done("a");
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_queue_done_without_requeue() {
        let queue = WorkQueue::new();
        let token = CancellationToken::new();
        queue.add("a");
        let name = queue.next(&token).await.unwrap();
        queue.done(&name);
        assert!(queue.is_empty());
        assert!(!queue.is_in_flight("a"));
    }

    #[tokio::test]
    async fn test_queue_shutdown_releases_waiters() {
        let queue = WorkQueue::new();
        let token = CancellationToken::new();
        let mut waiting = task::spawn(queue.next(&token));
        assert_pending!(waiting.poll());

        queue.shutdown();
        assert_ready_eq!(waiting.poll(), None);
        queue.add("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_cancel_releases_waiters() {
        let queue = WorkQueue::new();
        let token = CancellationToken::new();
        let mut waiting = task::spawn(queue.next(&token));
        assert_pending!(waiting.poll());

        token.cancel();
        assert_ready_eq!(waiting.poll(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_delay() {
        let queue = WorkQueue::new();
        let token = CancellationToken::new();
        queue.add_after("a", Duration::from_secs(5), &token);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_depth_follows_every_requeue_path() {
        let depth = IntGauge::new("depth", "pending names").unwrap();
        let queue = WorkQueue::with_depth_gauge(depth.clone());
        let token = CancellationToken::new();

        queue.add("a");
        queue.add("b");
        assert_eq!(depth.get(), 2);
        let name = queue.next(&token).await.unwrap();
        assert_eq!(depth.get(), 1);

        // Parked while in flight, pending again once done
        queue.add(&name);
        assert_eq!(depth.get(), 1);
        queue.done(&name);
        assert_eq!(depth.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_depth_counts_delayed_retries() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        let s = scheduler(&cluster, ControllerConfig::default());
        let token = CancellationToken::new();

        cluster.set_unavailable(true);
        s.process("all", &token).await;
        assert_eq!(s.metrics.queue_depth.get(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(s.metrics.queue_depth.get(), 1);
    }

    #[tokio::test]
    async fn test_pod_event_enqueues_matching_trackers() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        cluster.create_tracker("only-a", "ns-a");
        cluster.create_tracker("only-b", "ns-b");
        let s = scheduler(&cluster, ControllerConfig::default());

        s.handle_event(TriggerEvent::Pod(WatchEvent::Added(addressed_pod(
            "ns-a", "web-0", "10.0.0.5",
        ))))
        .await;

        assert_eq!(s.queue().len(), 2);
        assert_eq!(s.metrics.fanout_requests.get(), 2);
    }

    #[tokio::test]
    async fn test_tracker_event_enqueues_itself() {
        let cluster = InMemoryCluster::new();
        let s = scheduler(&cluster, ControllerConfig::default());
        s.handle_event(TriggerEvent::Tracker(WatchEvent::Modified("all".into())))
            .await;
        s.handle_event(TriggerEvent::Tracker(WatchEvent::Modified("all".into())))
            .await;
        assert_eq!(s.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_enqueues_every_tracker() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("a", "");
        cluster.create_tracker("b", "ns-b");
        let s = scheduler(&cluster, ControllerConfig::default());

        assert_eq!(s.resync().await.unwrap(), 2);
        assert_eq!(s.queue().len(), 2);

        cluster.set_unavailable(true);
        assert!(s.resync().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconcile_retried_with_backoff() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        let s = scheduler(&cluster, ControllerConfig::default());
        let token = CancellationToken::new();

        cluster.set_unavailable(true);
        s.process("all", &token).await;
        assert_eq!(s.metrics.reconcile_errors.get(), 1);
        assert!(s.backoffs.lock().contains_key("all"));
        assert!(s.queue().is_empty());

        // Longer than the largest randomized first delay
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(s.queue().len(), 1);

        cluster.set_unavailable(false);
        s.process("all", &token).await;
        assert!(!s.backoffs.lock().contains_key("all"));
        assert_eq!(
            s.metrics
                .reconciles
                .with_label_values(&["finalizer_added"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let cluster = InMemoryCluster::new();
        let config = ControllerConfig {
            retry_initial_delay_ms: 100,
            retry_max_delay_secs: 1,
            ..Default::default()
        };
        let s = scheduler(&cluster, config);
        let delays: Vec<Duration> = (0..10).map(|_| s.next_delay("all")).collect();
        assert!(delays[0] <= Duration::from_millis(150));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1500)));
        assert!(delays[9] >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_run_converges_and_stops_on_cancel() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        cluster.upsert_pod(addressed_pod("default", "web-0", "10.0.0.5"));
        let config = ControllerConfig {
            workers: 2,
            ..Default::default()
        };
        let s = scheduler(&cluster, config);
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let handle = tokio::spawn(s.clone().run(rx, token.clone()));

        // First cycle adds the finalizer; the event drives the status cycle
        for _ in 0..100 {
            if cluster.tracker("all").map(|t| t.has_finalizer()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(TriggerEvent::Tracker(WatchEvent::Modified("all".into())))
            .await
            .unwrap();
        for _ in 0..100 {
            if !cluster.tracker("all").unwrap().pod_ips().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cluster.tracker("all").unwrap().pod_ips().len(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
