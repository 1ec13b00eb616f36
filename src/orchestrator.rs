//! Per-key fetch orchestration.
//!
//! Each key owns a generation counter. A request bumps it and spawns a ticket
//! task; the task's outcome is applied only if its generation is still the
//! latest for the key when it completes, so the last-issued request wins no
//! matter how completions interleave. Identical in-flight requests are
//! deduplicated, and the loading signal only rises once a ticket has been
//! outstanding for the debounce window.

use crate::errors::FetchError;
use crate::notify::{Listeners, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Refetch even if the same fingerprint is already in flight.
    pub force: bool,
}

impl RequestOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Outcome of a ticket that was still current when it completed.
#[derive(Debug, Clone)]
pub enum Settled<T> {
    Applied {
        key: String,
        fingerprint: String,
        data: Arc<T>,
    },
    Failed {
        key: String,
        fingerprint: String,
        error: FetchError,
    },
}

impl<T> Settled<T> {
    pub fn key(&self) -> &str {
        match self {
            Self::Applied { key, .. } | Self::Failed { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeySnapshot<T> {
    /// Last successfully applied result; failures never clear it.
    pub data: Option<Arc<T>>,
    pub applied_fingerprint: Option<String>,
    pub error: Option<FetchError>,
    pub in_flight: Option<String>,
    pub generation: u64,
}

impl<T> Default for KeySnapshot<T> {
    fn default() -> Self {
        Self {
            data: None,
            applied_fingerprint: None,
            error: None,
            in_flight: None,
            generation: 0,
        }
    }
}

struct Ticket {
    fingerprint: String,
    generation: u64,
    started_at: Instant,
    shown: bool,
    task: Option<JoinHandle<()>>,
}

struct KeyState<T> {
    generation: u64,
    current: Option<Ticket>,
    data: Option<Arc<T>>,
    applied_fingerprint: Option<String>,
    error: Option<FetchError>,
}

impl<T> Default for KeyState<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            current: None,
            data: None,
            applied_fingerprint: None,
            error: None,
        }
    }
}

struct State<T> {
    keys: HashMap<String, KeyState<T>>,
    /// Superseded tickets whose tasks are still running.
    detached: Vec<JoinHandle<()>>,
    running: usize,
    shown: usize,
    closed: bool,
}

struct Inner<T> {
    debounce: Duration,
    state: Mutex<State<T>>,
    loading: watch::Sender<bool>,
    loading_listeners: Listeners<bool>,
    settled: Listeners<Settled<T>>,
    idle: Notify,
}

pub struct FetchOrchestrator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FetchOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for FetchOrchestrator<T> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl<T: Send + Sync + 'static> FetchOrchestrator<T> {
    pub fn new(debounce: Duration) -> Self {
        let (loading, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                debounce,
                state: Mutex::new(State {
                    keys: HashMap::new(),
                    detached: Vec::new(),
                    running: 0,
                    shown: 0,
                    closed: false,
                }),
                loading,
                loading_listeners: Listeners::new(),
                settled: Listeners::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Starts a fetch for `key` unless an identical one is already in flight.
    /// Returns whether the producer was invoked.
    pub fn request<F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        producer: F,
        options: RequestOptions,
    ) -> bool
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.closed {
                debug!(%key, "orchestrator closed; ignoring request");
                return false;
            }

            let State {
                keys,
                detached,
                running,
                ..
            } = &mut *state;
            let entry = keys.entry(key.to_owned()).or_default();

            if let Some(ticket) = &entry.current
                && ticket.fingerprint == fingerprint
                && !options.force
            {
                debug!(%key, generation = ticket.generation, "identical request already in flight");
                return false;
            }

            entry.generation += 1;
            let generation = entry.generation;
            // a visible spinner carries over to the replacement ticket
            let mut inherited_spinner = false;
            if let Some(previous) = entry.current.take() {
                debug!(
                    %key,
                    superseded = previous.generation,
                    by = generation,
                    "superseding in-flight request"
                );
                inherited_spinner = previous.shown;
                if let Some(task) = previous.task {
                    detached.push(task);
                }
            }
            detached.retain(|task| !task.is_finished());

            entry.current = Some(Ticket {
                fingerprint: fingerprint.to_owned(),
                generation,
                started_at: Instant::now(),
                shown: inherited_spinner,
                task: None,
            });
            *running += 1;
            generation
        };

        let future = producer(fingerprint.to_owned());
        let task = tokio::spawn(run_ticket(
            Arc::downgrade(&self.inner),
            key.to_owned(),
            generation,
            self.inner.debounce,
            future,
        ));

        let mut state = self.inner.state.lock();
        let State { keys, detached, .. } = &mut *state;
        match keys
            .get_mut(key)
            .and_then(|entry| entry.current.as_mut())
            .filter(|ticket| ticket.generation == generation)
        {
            Some(ticket) => ticket.task = Some(task),
            None => detached.push(task),
        }
        true
    }

    pub fn snapshot(&self, key: &str) -> KeySnapshot<T> {
        let state = self.inner.state.lock();
        state
            .keys
            .get(key)
            .map(|entry| KeySnapshot {
                data: entry.data.clone(),
                applied_fingerprint: entry.applied_fingerprint.clone(),
                error: entry.error.clone(),
                in_flight: entry.current.as_ref().map(|t| t.fingerprint.clone()),
                generation: entry.generation,
            })
            .unwrap_or_default()
    }

    pub fn data(&self, key: &str) -> Option<Arc<T>> {
        self.snapshot(key).data
    }

    pub fn error(&self, key: &str) -> Option<FetchError> {
        self.snapshot(key).error
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.snapshot(key).in_flight.is_some()
    }

    /// True while any key has a current ticket.
    pub fn has_in_flight(&self) -> bool {
        let state = self.inner.state.lock();
        state.keys.values().any(|entry| entry.current.is_some())
    }

    pub fn is_loading(&self) -> bool {
        *self.inner.loading.borrow()
    }

    pub fn loading_receiver(&self) -> watch::Receiver<bool> {
        self.inner.loading.subscribe()
    }

    /// Observes every loading-signal transition.
    pub fn on_loading(&self, callback: impl Fn(&bool) + Send + Sync + 'static) -> Subscription {
        self.inner.loading_listeners.subscribe(callback)
    }

    /// Observes outcomes of current tickets. Superseded outcomes never arrive here.
    pub fn on_settled(
        &self,
        callback: impl Fn(&Settled<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.settled.subscribe(callback)
    }

    /// Resolves once no ticket task (current or superseded) is running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().running == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancels every timer and task; nothing is applied afterwards.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.running = 0;
            state.shown = 0;
            let mut tasks: Vec<JoinHandle<()>> = state.detached.drain(..).collect();
            for entry in state.keys.values_mut() {
                if let Some(task) = entry.current.take().and_then(|ticket| ticket.task) {
                    tasks.push(task);
                }
            }
            tasks
        };
        info!(aborted = tasks.len(), "fetch orchestrator shut down");
        self.inner.publish_loading(false);
        for task in tasks {
            task.abort();
        }
        self.inner.idle.notify_waiters();
    }
}

async fn run_ticket<T, Fut>(
    inner: Weak<Inner<T>>,
    key: String,
    generation: u64,
    debounce: Duration,
    future: Fut,
) where
    T: Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    tokio::pin!(future);
    let outcome = tokio::select! {
        biased;
        outcome = &mut future => outcome,
        _ = tokio::time::sleep(debounce) => {
            if let Some(inner) = inner.upgrade() {
                inner.show_spinner(&key, generation);
            }
            future.await
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.complete(&key, generation, outcome);
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn show_spinner(&self, key: &str, generation: u64) {
        let loading = {
            let mut state = self.state.lock();
            let State { keys, shown, .. } = &mut *state;
            match keys
                .get_mut(key)
                .and_then(|entry| entry.current.as_mut())
                .filter(|ticket| ticket.generation == generation && !ticket.shown)
            {
                Some(ticket) => {
                    ticket.shown = true;
                    *shown += 1;
                }
                None => return,
            }
            *shown > 0
        };
        self.publish_loading(loading);
    }

    fn complete(&self, key: &str, generation: u64, outcome: Result<T, FetchError>) {
        let (event, loading) = {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            if state.closed {
                debug!(%key, generation, "discarding result after shutdown");
                return;
            }

            let State { keys, shown, .. } = &mut *state;
            let entry = keys.entry(key.to_owned()).or_default();
            let event = match entry
                .current
                .take_if(|ticket| ticket.generation == generation)
            {
                Some(ticket) => {
                    if ticket.shown {
                        *shown = shown.saturating_sub(1);
                    }
                    let elapsed = ticket.started_at.elapsed();
                    Some(match outcome {
                        Ok(data) => {
                            debug!(%key, generation, ?elapsed, "fetch applied");
                            let data = Arc::new(data);
                            entry.data = Some(Arc::clone(&data));
                            entry.applied_fingerprint = Some(ticket.fingerprint.clone());
                            entry.error = None;
                            Settled::Applied {
                                key: key.to_owned(),
                                fingerprint: ticket.fingerprint,
                                data,
                            }
                        }
                        Err(error) => {
                            warn!(%key, generation, ?elapsed, %error, "fetch failed");
                            entry.error = Some(error.clone());
                            Settled::Failed {
                                key: key.to_owned(),
                                fingerprint: ticket.fingerprint,
                                error,
                            }
                        }
                    })
                }
                None => {
                    debug!(
                        %key,
                        generation,
                        latest = entry.generation,
                        failed = outcome.is_err(),
                        "discarding result: {}",
                        FetchError::Superseded
                    );
                    None
                }
            };
            (event, *shown > 0)
        };

        self.publish_loading(loading);
        if let Some(event) = event {
            self.settled.emit(&event);
        }
        self.idle.notify_waiters();
    }

    fn publish_loading(&self, next: bool) {
        let changed = self.loading.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(loading = next, "loading signal changed");
            self.loading_listeners.emit(&next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    type Reply = oneshot::Sender<Result<&'static str, FetchError>>;

    /// Producer whose completion is driven by the returned sender.
    fn pending() -> (
        Reply,
        impl FnOnce(String) -> std::pin::Pin<Box<dyn Future<Output = Result<&'static str, FetchError>> + Send>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let producer = move |_fingerprint: String| {
            Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(FetchError::network("producer dropped")))
            }) as std::pin::Pin<Box<dyn Future<Output = _> + Send>>
        };
        (tx, producer)
    }

    fn trace(orchestrator: &FetchOrchestrator<&'static str>) -> (Arc<Mutex<Vec<bool>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            orchestrator.on_loading(move |loading| seen.lock().push(*loading))
        };
        (seen, sub)
    }

    fn settled(orchestrator: &FetchOrchestrator<&'static str>) -> (Arc<Mutex<Vec<Settled<&'static str>>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            orchestrator.on_settled(move |event| seen.lock().push(event.clone()))
        };
        (seen, sub)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn identical_requests_invoke_producer_once() {
        let orchestrator = FetchOrchestrator::new(DEFAULT_DEBOUNCE);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();
        let rx = Arc::new(Mutex::new(Some(rx)));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let rx = Arc::clone(&rx);
            orchestrator.request(
                "stats",
                "fp-a",
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let rx = rx.lock().take();
                    async move {
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok("data")
                    }
                },
                RequestOptions::default(),
            );
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(orchestrator.is_in_flight("stats"));
        tx.send(()).unwrap();
        orchestrator.idle().await;
        assert!(!orchestrator.is_in_flight("stats"));
        assert_eq!(orchestrator.data("stats").as_deref(), Some(&"data"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn force_bypasses_dedup() {
        let orchestrator = FetchOrchestrator::new(DEFAULT_DEBOUNCE);
        let (first_tx, first) = pending();
        let (second_tx, second) = pending();

        assert!(orchestrator.request("stats", "fp", first, RequestOptions::default()));
        assert!(orchestrator.request("stats", "fp", second, RequestOptions::forced()));
        assert_eq!(orchestrator.snapshot("stats").generation, 2);

        second_tx.send(Ok("fresh")).unwrap();
        first_tx.send(Ok("stale")).unwrap();
        orchestrator.idle().await;
        assert_eq!(orchestrator.data("stats").as_deref(), Some(&"fresh"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn later_request_wins_regardless_of_completion_order() {
        let orchestrator = FetchOrchestrator::new(DEFAULT_DEBOUNCE);
        let (events, _sub) = settled(&orchestrator);
        let (a_tx, producer_a) = pending();
        let (b_tx, producer_b) = pending();

        orchestrator.request("stats", "fp-a", producer_a, RequestOptions::default());
        orchestrator.request("stats", "fp-b", producer_b, RequestOptions::default());

        b_tx.send(Ok("b")).unwrap();
        tokio::task::yield_now().await;
        a_tx.send(Ok("a")).unwrap();
        orchestrator.idle().await;

        let snapshot = orchestrator.snapshot("stats");
        assert_eq!(snapshot.data.as_deref(), Some(&"b"));
        assert_eq!(snapshot.applied_fingerprint.as_deref(), Some("fp-b"));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Settled::Applied { fingerprint, .. } if fingerprint == "fp-b"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn superseded_errors_are_never_surfaced() {
        let orchestrator = FetchOrchestrator::new(DEFAULT_DEBOUNCE);
        let (events, _sub) = settled(&orchestrator);
        let (a_tx, producer_a) = pending();
        let (b_tx, producer_b) = pending();

        orchestrator.request("stats", "fp-a", producer_a, RequestOptions::default());
        orchestrator.request("stats", "fp-b", producer_b, RequestOptions::default());

        b_tx.send(Ok("b")).unwrap();
        a_tx.send(Err(FetchError::network("boom"))).unwrap();
        orchestrator.idle().await;

        assert_eq!(orchestrator.error("stats"), None);
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failure_keeps_last_good_data() {
        let orchestrator = FetchOrchestrator::new(DEFAULT_DEBOUNCE);
        orchestrator.request("stats", "fp-a", |_| async { Ok("good") }, RequestOptions::default());
        orchestrator.idle().await;

        orchestrator.request(
            "stats",
            "fp-b",
            |_| async { Err(FetchError::Timeout(Duration::from_secs(30))) },
            RequestOptions::default(),
        );
        orchestrator.idle().await;

        let snapshot = orchestrator.snapshot("stats");
        assert_eq!(snapshot.data.as_deref(), Some(&"good"));
        assert_eq!(snapshot.applied_fingerprint.as_deref(), Some("fp-a"));
        assert_eq!(snapshot.error, Some(FetchError::Timeout(Duration::from_secs(30))));
        assert_eq!(snapshot.in_flight, None);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn fast_fetch_never_raises_loading() {
        let orchestrator = FetchOrchestrator::new(Duration::from_millis(300));
        let (seen, _sub) = trace(&orchestrator);

        orchestrator.request(
            "stats",
            "fp",
            |_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok("quick")
            },
            RequestOptions::default(),
        );
        orchestrator.idle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(seen.lock().is_empty());
        assert!(!orchestrator.is_loading());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn slow_fetch_raises_then_clears_loading() {
        let orchestrator = FetchOrchestrator::new(Duration::from_millis(300));
        let (seen, _sub) = trace(&orchestrator);
        let (tx, producer) = pending();

        orchestrator.request("stats", "fp", producer, RequestOptions::default());
        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(!orchestrator.is_loading());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(orchestrator.is_loading());

        tx.send(Err(FetchError::network("down"))).unwrap();
        orchestrator.idle().await;
        assert!(!orchestrator.is_loading());
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn supersession_keeps_visible_spinner_until_replacement_finishes() {
        let orchestrator = FetchOrchestrator::new(Duration::from_millis(300));
        let (seen, _sub) = trace(&orchestrator);
        let (a_tx, producer_a) = pending();
        let (b_tx, producer_b) = pending();

        orchestrator.request("stats", "fp-a", producer_a, RequestOptions::default());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(orchestrator.is_loading());

        orchestrator.request("stats", "fp-b", producer_b, RequestOptions::default());
        a_tx.send(Ok("a")).unwrap();
        tokio::task::yield_now().await;
        assert!(orchestrator.is_loading());

        b_tx.send(Ok("b")).unwrap();
        orchestrator.idle().await;
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn keys_are_independent() {
        let orchestrator = FetchOrchestrator::new(DEFAULT_DEBOUNCE);
        let (meta_tx, metadata) = pending();
        let (stats_tx, stats) = pending();

        let (events, _events_sub) = settled(&orchestrator);
        assert!(orchestrator.request("metadata", "fp", metadata, RequestOptions::default()));
        assert!(orchestrator.request("stats", "fp", stats, RequestOptions::default()));

        stats_tx.send(Ok("stats")).unwrap();
        meta_tx.send(Ok("meta")).unwrap();
        orchestrator.idle().await;
        let mut keys: Vec<String> = events.lock().iter().map(|e| e.key().to_owned()).collect();
        keys.sort();
        assert_eq!(keys, vec!["metadata", "stats"]);
        assert_eq!(orchestrator.data("metadata").as_deref(), Some(&"meta"));
        assert_eq!(orchestrator.data("stats").as_deref(), Some(&"stats"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn shutdown_discards_late_results_and_timers() {
        let orchestrator = FetchOrchestrator::new(Duration::from_millis(300));
        let (seen, _sub) = trace(&orchestrator);
        let (events, _events_sub) = settled(&orchestrator);
        let (tx, producer) = pending();

        orchestrator.request("stats", "fp", producer, RequestOptions::default());
        orchestrator.shutdown();
        let _ = tx.send(Ok("late"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.idle().await;

        assert!(seen.lock().is_empty());
        assert!(events.lock().is_empty());
        assert_eq!(orchestrator.data("stats"), None);
        assert!(!orchestrator.request("stats", "fp", |_| async { Ok("x") }, RequestOptions::default()));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn shutdown_lowers_a_visible_spinner() {
        let orchestrator = FetchOrchestrator::new(Duration::from_millis(300));
        let (seen, _sub) = trace(&orchestrator);
        let receiver = orchestrator.loading_receiver();
        let (_tx, producer) = pending();

        orchestrator.request("stats", "fp", producer, RequestOptions::default());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(orchestrator.is_loading());

        orchestrator.shutdown();
        assert!(!orchestrator.is_loading());
        assert!(!*receiver.borrow());
        assert_eq!(*seen.lock(), vec![true, false]);
    }
}
