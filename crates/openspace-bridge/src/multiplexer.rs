//! Fan-out of the backend's two terminal event streams to interested listeners.
//!
//! The multiplexer subscribes once to `terminal:output` and `terminal:exit`
//! and routes each event by session id:
//!
//! - global listeners see every event;
//! - per-session listeners see their session's events;
//! - output for a session with no per-session listener is kept in a bounded
//!   [`Backlog`] and flushed to the first listener that attaches;
//! - an exit with no per-session listener is remembered for a retention
//!   window and handed to the first exit listener that attaches in time.
//!
//! Output for one session reaches its listeners in backend order. While a
//! late listener is being handed the backlog, newer chunks (and the exit)
//! for that session queue behind it.
//!
//! An exit is the last event forwarded for a session. All state for that id
//! is torn down with the exit, and stragglers arriving within the retention
//! window afterwards are dropped.
//!
//! Listeners run with no internal lock held, so they may subscribe or
//! unsubscribe from inside the callback. A panicking listener is logged and
//! skipped; it never prevents delivery to its siblings.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use openspace_ipc::{
    EventStream, ExitEvent, OutputEvent, SessionId, Transport, TransportError, EXIT_EVENT,
    OUTPUT_EVENT,
};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::backlog::Backlog;
use crate::config::BridgeConfig;
use crate::subscription::Subscription;

pub type OutputListener = Arc<dyn Fn(&OutputEvent) + Send + Sync>;
pub type ExitListener = Arc<dyn Fn(&ExitEvent) + Send + Sync>;

type ListenerId = u64;

/// An exit nobody was listening for yet.
struct DelayedExit {
    event: ExitEvent,
    recorded_at: Instant,
}

/// Events held back while a backlog is being flushed.
#[derive(Default)]
struct Flush {
    queued: Vec<String>,
    exit: Option<ExitEvent>,
}

#[derive(Default)]
struct MuxState {
    next_id: ListenerId,
    global_output: Vec<(ListenerId, OutputListener)>,
    global_exit: Vec<(ListenerId, ExitListener)>,
    session_output: HashMap<SessionId, Vec<(ListenerId, OutputListener)>>,
    session_exit: HashMap<SessionId, Vec<(ListenerId, ExitListener)>>,
    backlogs: HashMap<SessionId, Backlog>,
    delayed_exits: HashMap<SessionId, DelayedExit>,
    /// Sessions that have produced their exit event, and when.
    exited: HashMap<SessionId, Instant>,
    flushing: HashMap<SessionId, Flush>,
}

impl MuxState {
    fn allocate_id(&mut self) -> ListenerId {
        self.next_id += 1;
        self.next_id
    }

    fn purge_expired(&mut self, retention: Duration) {
        self.delayed_exits.retain(|session_id, record| {
            let keep = record.recorded_at.elapsed() < retention;
            if !keep {
                log::debug!("discarding unclaimed exit for session {session_id}");
            }
            keep
        });
        self.exited.retain(|_, at| at.elapsed() < retention);
    }

    fn output_targets(&self, session_id: &SessionId) -> Vec<OutputListener> {
        self.session_output
            .get(session_id)
            .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    fn buffer(&mut self, session_id: &SessionId, data: &str, cap: usize) {
        self.backlogs
            .entry(session_id.clone())
            .or_insert_with(|| Backlog::new(cap))
            .push(data);
    }
}

enum Slot {
    GlobalOutput,
    GlobalExit,
    SessionOutput(SessionId),
    SessionExit(SessionId),
}

struct Inner {
    state: Mutex<MuxState>,
    transport: Arc<dyn Transport>,
    subscribed: OnceCell<()>,
    backlog_cap: usize,
    exit_retention: Duration,
}

/// Routes backend terminal events to listeners by session id.
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct EventMultiplexer {
    inner: Arc<Inner>,
}

impl EventMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, config: &BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MuxState::default()),
                transport,
                subscribed: OnceCell::new(),
                backlog_cap: config.backlog_cap_bytes,
                exit_retention: config.exit_retention(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the backend event streams.
    ///
    /// Safe to call any number of times, concurrently or not: the streams are
    /// opened exactly once and every caller waits for that single attempt. A
    /// failed attempt is not cached, so a later call retries.
    pub async fn init(&self) -> Result<(), TransportError> {
        self.inner
            .subscribed
            .get_or_try_init(|| async {
                let output = self.inner.transport.listen(OUTPUT_EVENT).await?;
                let exit = self.inner.transport.listen(EXIT_EVENT).await?;
                tokio::spawn(pump(Arc::downgrade(&self.inner), output, exit));
                log::debug!("subscribed to {OUTPUT_EVENT} and {EXIT_EVENT}");
                Ok::<(), TransportError>(())
            })
            .await
            .map(|_| ())
    }

    /// Whether [`init`](Self::init) has completed successfully.
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.initialized()
    }

    /// Route one output chunk.
    pub fn dispatch_output(&self, event: OutputEvent) {
        let (globals, targets) = {
            let mut state = self.lock();
            if state.exited.contains_key(&event.session_id) {
                log::debug!(
                    "dropping {} bytes of output for exited session {}",
                    event.data.len(),
                    event.session_id
                );
                return;
            }

            let globals: Vec<OutputListener> =
                state.global_output.iter().map(|(_, l)| Arc::clone(l)).collect();
            let targets = match state.flushing.get_mut(&event.session_id) {
                Some(flush) => {
                    flush.queued.push(event.data.clone());
                    Vec::new()
                }
                None => {
                    let targets = state.output_targets(&event.session_id);
                    if targets.is_empty() {
                        state.buffer(&event.session_id, &event.data, self.inner.backlog_cap);
                    }
                    targets
                }
            };
            (globals, targets)
        };

        for listener in globals.iter().chain(targets.iter()) {
            isolate("output", &event.session_id, || listener(&event));
        }
    }

    /// Route one exit event and tear down everything held for the session.
    pub fn dispatch_exit(&self, event: ExitEvent) {
        let (globals, targets) = {
            let mut state = self.lock();
            if state.exited.contains_key(&event.session_id) {
                log::debug!("ignoring repeated exit for session {}", event.session_id);
                return;
            }
            if let Some(flush) = state.flushing.get_mut(&event.session_id) {
                if flush.exit.is_none() {
                    flush.exit = Some(event);
                }
                return;
            }
            state.purge_expired(self.inner.exit_retention);
            state.exited.insert(event.session_id.clone(), Instant::now());

            let globals: Vec<ExitListener> =
                state.global_exit.iter().map(|(_, l)| Arc::clone(l)).collect();
            let targets: Vec<ExitListener> = state
                .session_exit
                .remove(&event.session_id)
                .map(|ls| ls.into_iter().map(|(_, l)| l).collect())
                .unwrap_or_default();

            if targets.is_empty() {
                state.delayed_exits.insert(
                    event.session_id.clone(),
                    DelayedExit {
                        event: event.clone(),
                        recorded_at: Instant::now(),
                    },
                );
            }
            state.backlogs.remove(&event.session_id);
            state.session_output.remove(&event.session_id);
            (globals, targets)
        };

        log::debug!(
            "session {} exited with code {} ({} session listener(s))",
            event.session_id,
            event.exit_code,
            targets.len()
        );
        for listener in globals.iter().chain(targets.iter()) {
            isolate("exit", &event.session_id, || listener(&event));
        }
    }

    /// Listen to output from every session.
    pub fn on_output<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OutputEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = state.allocate_id();
            state.global_output.push((id, Arc::new(listener)));
            id
        };
        self.subscription(Slot::GlobalOutput, id)
    }

    /// Listen to exits of every session.
    pub fn on_exit<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ExitEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = state.allocate_id();
            state.global_exit.push((id, Arc::new(listener)));
            id
        };
        self.subscription(Slot::GlobalExit, id)
    }

    /// Listen to output from one session.
    ///
    /// Output buffered while nobody listened is delivered to `listener` as a
    /// single chunk before this returns, followed by anything that arrived
    /// for the session during that delivery.
    pub fn on_session_output<F>(&self, session_id: &SessionId, listener: F) -> Subscription
    where
        F: Fn(&OutputEvent) + Send + Sync + 'static,
    {
        let listener: OutputListener = Arc::new(listener);
        let (id, pending) = {
            let mut state = self.lock();
            if state.exited.contains_key(session_id) {
                return Subscription::spent();
            }
            let id = state.allocate_id();
            state
                .session_output
                .entry(session_id.clone())
                .or_default()
                .push((id, Arc::clone(&listener)));
            let pending = state.backlogs.remove(session_id).filter(|b| !b.is_empty());
            if pending.is_some() {
                state.flushing.insert(session_id.clone(), Flush::default());
            }
            (id, pending)
        };
        let subscription = self.subscription(Slot::SessionOutput(session_id.clone()), id);

        if let Some(backlog) = pending {
            if backlog.dropped() > 0 {
                log::debug!(
                    "backlog for session {session_id} dropped {} bytes over cap",
                    backlog.dropped()
                );
            }
            let event = OutputEvent {
                session_id: session_id.clone(),
                data: backlog.into_string(),
            };
            isolate("output", session_id, || listener(&event));
            self.finish_flush(session_id);
        }
        subscription
    }

    /// Deliver what queued up during a backlog flush, then release any
    /// exit held behind it.
    fn finish_flush(&self, session_id: &SessionId) {
        loop {
            let (chunks, targets) = {
                let mut state = self.lock();
                let Some(flush) = state.flushing.get_mut(session_id) else {
                    return;
                };
                if flush.queued.is_empty() {
                    let exit = state.flushing.remove(session_id).and_then(|f| f.exit);
                    drop(state);
                    if let Some(exit) = exit {
                        self.dispatch_exit(exit);
                    }
                    return;
                }
                let chunks = std::mem::take(&mut flush.queued);
                let targets = state.output_targets(session_id);
                if targets.is_empty() {
                    for data in &chunks {
                        state.buffer(session_id, data, self.inner.backlog_cap);
                    }
                }
                (chunks, targets)
            };

            for data in chunks {
                let event = OutputEvent {
                    session_id: session_id.clone(),
                    data,
                };
                for listener in &targets {
                    isolate("output", session_id, || listener(&event));
                }
            }
        }
    }

    /// Listen for the exit of one session.
    ///
    /// If the session already exited within the retention window, `listener`
    /// receives that exit before this returns and the record is consumed.
    pub fn on_session_exit<F>(&self, session_id: &SessionId, listener: F) -> Subscription
    where
        F: Fn(&ExitEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.purge_expired(self.inner.exit_retention);
        let delayed = state.delayed_exits.remove(session_id);

        if let Some(record) = delayed {
            drop(state);
            isolate("exit", session_id, || listener(&record.event));
            return Subscription::spent();
        }
        if state.exited.contains_key(session_id) {
            return Subscription::spent();
        }

        let id = state.allocate_id();
        state
            .session_exit
            .entry(session_id.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        drop(state);
        self.subscription(Slot::SessionExit(session_id.clone()), id)
    }

    fn subscription(&self, slot: Slot, id: ListenerId) -> Subscription {
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                EventMultiplexer { inner }.remove_listener(slot, id);
            }
        })
    }

    fn remove_listener(&self, slot: Slot, id: ListenerId) {
        let mut state = self.lock();
        match slot {
            Slot::GlobalOutput => state.global_output.retain(|(lid, _)| *lid != id),
            Slot::GlobalExit => state.global_exit.retain(|(lid, _)| *lid != id),
            Slot::SessionOutput(session_id) => {
                remove_from_set(&mut state.session_output, &session_id, id)
            }
            Slot::SessionExit(session_id) => {
                remove_from_set(&mut state.session_exit, &session_id, id)
            }
        }
    }

    /// Bytes currently buffered for `session_id`.
    pub fn backlog_len(&self, session_id: &SessionId) -> usize {
        self.lock()
            .backlogs
            .get(session_id)
            .map(Backlog::len)
            .unwrap_or(0)
    }

    /// Whether an unclaimed, unexpired exit is held for `session_id`.
    pub fn has_pending_exit(&self, session_id: &SessionId) -> bool {
        let mut state = self.lock();
        state.purge_expired(self.inner.exit_retention);
        state.delayed_exits.contains_key(session_id)
    }

    /// Per-session listeners (output and exit) registered for `session_id`.
    pub fn listener_count(&self, session_id: &SessionId) -> usize {
        let state = self.lock();
        let output = state.session_output.get(session_id).map_or(0, Vec::len);
        let exit = state.session_exit.get(session_id).map_or(0, Vec::len);
        output + exit
    }

    /// Number of session ids with a per-session listener set.
    pub fn tracked_sessions(&self) -> usize {
        let state = self.lock();
        let mut ids: HashSet<&SessionId> = state.session_output.keys().collect();
        ids.extend(state.session_exit.keys());
        ids.len()
    }

    /// Whether `session_id` produced its exit event within the retention
    /// window.
    pub fn has_exited(&self, session_id: &SessionId) -> bool {
        let mut state = self.lock();
        state.purge_expired(self.inner.exit_retention);
        state.exited.contains_key(session_id)
    }

    fn handle_payload(&self, event: &str, payload: Value) {
        if event == OUTPUT_EVENT {
            match serde_json::from_value::<OutputEvent>(payload) {
                Ok(e) => self.dispatch_output(e),
                Err(e) => log::warn!("malformed {OUTPUT_EVENT} payload: {e}"),
            }
        } else {
            match serde_json::from_value::<ExitEvent>(payload) {
                Ok(e) => self.dispatch_exit(e),
                Err(e) => log::warn!("malformed {EXIT_EVENT} payload: {e}"),
            }
        }
    }
}

fn remove_from_set<L>(
    sets: &mut HashMap<SessionId, Vec<(ListenerId, L)>>,
    session_id: &SessionId,
    id: ListenerId,
) {
    if let Some(listeners) = sets.get_mut(session_id) {
        listeners.retain(|(lid, _)| *lid != id);
        if listeners.is_empty() {
            sets.remove(session_id);
        }
    }
}

/// Run one listener, containing any panic it raises.
fn isolate(kind: &str, session_id: &SessionId, deliver: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(deliver)).is_err() {
        log::error!("{kind} listener for session {session_id} panicked; skipped");
    }
}

/// Drain both backend streams into the multiplexer.
///
/// Output is polled first so chunks queued ahead of an exit are routed
/// before it.
async fn pump(mux: Weak<Inner>, mut output: EventStream, mut exit: EventStream) {
    let mut output_open = true;
    let mut exit_open = true;

    while output_open || exit_open {
        let (event, payload) = tokio::select! {
            biased;
            payload = output.recv(), if output_open => match payload {
                Some(p) => (OUTPUT_EVENT, p),
                None => {
                    output_open = false;
                    continue;
                }
            },
            payload = exit.recv(), if exit_open => match payload {
                Some(p) => (EXIT_EVENT, p),
                None => {
                    exit_open = false;
                    continue;
                }
            },
        };

        let Some(inner) = mux.upgrade() else {
            break;
        };
        EventMultiplexer { inner }.handle_payload(event, payload);
    }
    log::debug!("terminal event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use openspace_ipc::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn mux_with_cap(cap: usize) -> (Arc<MockTransport>, EventMultiplexer) {
        let mock = Arc::new(MockTransport::terminal_backend());
        let config = BridgeConfig {
            backlog_cap_bytes: cap,
            ..BridgeConfig::default()
        };
        let mux = EventMultiplexer::new(Arc::clone(&mock) as Arc<dyn Transport>, &config);
        (mock, mux)
    }

    fn mux() -> (Arc<MockTransport>, EventMultiplexer) {
        mux_with_cap(1024)
    }

    fn output(session: &str, data: &str) -> OutputEvent {
        OutputEvent {
            session_id: SessionId::new(session),
            data: data.to_string(),
        }
    }

    fn exit(session: &str, code: i32) -> ExitEvent {
        ExitEvent {
            session_id: SessionId::new(session),
            exit_code: code,
            signal: None,
        }
    }

    /// Collects delivered chunks.
    fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(&OutputEvent) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |e: &OutputEvent| sink.lock().unwrap().push(e.data.clone()))
    }

    #[test]
    fn test_output_without_listener_is_buffered() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");

        mux.dispatch_output(output("s1", "abc"));
        mux.dispatch_output(output("s1", "def"));

        assert_eq!(mux.backlog_len(&s1), 6);
    }

    #[test]
    fn test_backlog_cap_keeps_most_recent_bytes() {
        let (_mock, mux) = mux_with_cap(8);
        let s1 = SessionId::new("s1");

        mux.dispatch_output(output("s1", "0123456789"));
        mux.dispatch_output(output("s1", "ab"));
        assert_eq!(mux.backlog_len(&s1), 8);

        let (seen, listener) = collector();
        let _sub = mux.on_session_output(&s1, listener);
        assert_eq!(*seen.lock().unwrap(), vec!["456789ab".to_string()]);
    }

    #[test]
    fn test_flush_once_then_live() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        mux.dispatch_output(output("s1", "a"));
        mux.dispatch_output(output("s1", "b"));

        let (seen, listener) = collector();
        let sub = mux.on_session_output(&s1, listener);
        assert_eq!(*seen.lock().unwrap(), vec!["ab".to_string()]);
        assert_eq!(mux.backlog_len(&s1), 0);

        mux.dispatch_output(output("s1", "c"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ab".to_string(), "c".to_string()]
        );
        assert_eq!(mux.backlog_len(&s1), 0);

        // Once the set is empty again only new output is buffered.
        sub.unsubscribe();
        mux.dispatch_output(output("s1", "d"));
        let (seen_again, listener) = collector();
        let _sub = mux.on_session_output(&s1, listener);
        assert_eq!(*seen_again.lock().unwrap(), vec!["d".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_late_listener_with_empty_backlog_gets_nothing() {
        let (_mock, mux) = mux();
        let (seen, listener) = collector();
        let _sub = mux.on_session_output(&SessionId::new("s1"), listener);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_global_listener_does_not_prevent_buffering() {
        let (_mock, mux) = mux();
        let (seen, listener) = collector();
        let _global = mux.on_output(listener);

        mux.dispatch_output(output("s1", "x"));
        mux.dispatch_output(output("s2", "y"));

        assert_eq!(*seen.lock().unwrap(), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(mux.backlog_len(&SessionId::new("s1")), 1);
        assert_eq!(mux.backlog_len(&SessionId::new("s2")), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        let _bad_global = mux.on_output(|_| panic!("listener bug"));
        let _bad = mux.on_session_output(&s1, |_| panic!("listener bug"));
        let (seen, listener) = collector();
        let _good = mux.on_session_output(&s1, listener);

        mux.dispatch_output(output("s1", "still here"));

        assert_eq!(*seen.lock().unwrap(), vec!["still here".to_string()]);
        assert_eq!(mux.listener_count(&s1), 2);
    }

    #[test]
    fn test_unsubscribe_drops_empty_sets() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        let a = mux.on_session_output(&s1, |_| {});
        let b = mux.on_session_exit(&s1, |_| {});
        assert_eq!(mux.listener_count(&s1), 2);

        a.unsubscribe();
        a.unsubscribe();
        assert_eq!(mux.listener_count(&s1), 1);
        drop(b);
        assert_eq!(mux.listener_count(&s1), 0);
        assert_eq!(mux.tracked_sessions(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let own = Arc::clone(&slot);
        let counter = Arc::clone(&hits);
        let sub = mux.on_session_output(&s1, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = own.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        mux.dispatch_output(output("s1", "1"));
        mux.dispatch_output(output("s1", "2"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(mux.backlog_len(&s1), 1);
    }

    #[test]
    fn test_exit_delivered_live_to_session_listener() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&codes);
        let _sub = mux.on_session_exit(&s1, move |e| sink.lock().unwrap().push(e.exit_code));

        mux.dispatch_exit(exit("s1", 3));

        assert_eq!(*codes.lock().unwrap(), vec![3]);
        assert!(!mux.has_pending_exit(&s1));
    }

    #[test]
    fn test_exit_tears_down_session_state() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        mux.dispatch_output(output("s1", "unread"));
        let (seen, listener) = collector();
        let _out = mux.on_session_output(&SessionId::new("s2"), listener);
        let _exit = mux.on_session_exit(&SessionId::new("s2"), |_| {});

        mux.dispatch_exit(exit("s1", 0));
        mux.dispatch_exit(exit("s2", 0));

        assert_eq!(mux.backlog_len(&s1), 0);
        assert_eq!(mux.tracked_sessions(), 0);

        // Stragglers after exit are dropped, not re-buffered.
        mux.dispatch_output(output("s1", "late"));
        mux.dispatch_output(output("s2", "late"));
        assert_eq!(mux.backlog_len(&s1), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert!(mux.has_exited(&s1));
    }

    #[test]
    fn test_global_exit_listener_sees_every_exit() {
        let (_mock, mux) = mux();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = mux.on_exit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        mux.dispatch_exit(exit("s1", 0));
        mux.dispatch_exit(exit("s2", 1));
        mux.dispatch_exit(exit("s2", 1));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_output_dispatched_during_flush_follows_backlog() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        mux.dispatch_output(output("s1", "old"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let racer = Mutex::new(Some(mux.clone()));
        let _sub = mux.on_session_output(&s1, move |e| {
            // Live output lands from another thread while the backlog is
            // still being written.
            if let Some(other) = racer.lock().unwrap().take() {
                std::thread::spawn(move || other.dispatch_output(output("s1", "new")))
                    .join()
                    .unwrap();
            }
            sink.lock().unwrap().push(e.data.clone());
        });

        assert_eq!(*seen.lock().unwrap(), vec!["old", "new"]);
        assert_eq!(mux.backlog_len(&s1), 0);
        assert!(mux.lock().flushing.is_empty());
    }

    #[test]
    fn test_exit_during_flush_waits_for_queued_output() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        mux.dispatch_output(output("s1", "old"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let exit_sink = Arc::clone(&seen);
        let _exit_sub = mux.on_session_exit(&s1, move |e| {
            exit_sink.lock().unwrap().push(format!("exit {}", e.exit_code));
        });

        let sink = Arc::clone(&seen);
        let racer = Mutex::new(Some(mux.clone()));
        let _sub = mux.on_session_output(&s1, move |e| {
            if let Some(other) = racer.lock().unwrap().take() {
                other.dispatch_output(output("s1", "new"));
                other.dispatch_exit(exit("s1", 3));
            }
            sink.lock().unwrap().push(e.data.clone());
        });

        assert_eq!(*seen.lock().unwrap(), vec!["old", "new", "exit 3"]);
        assert!(mux.has_exited(&s1));
        assert_eq!(mux.tracked_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_tombstones_expire_with_retention() {
        let (_mock, mux) = mux();
        for i in 0..100 {
            mux.dispatch_exit(exit(&format!("old{i}"), 0));
        }
        assert_eq!(mux.lock().exited.len(), 100);

        tokio::time::advance(Duration::from_secs(30)).await;
        mux.dispatch_exit(exit("fresh", 0));

        assert_eq!(mux.lock().exited.len(), 1);
        assert!(!mux.has_exited(&SessionId::new("old0")));
        assert!(mux.has_exited(&SessionId::new("fresh")));

        // An id whose tombstone expired can carry output again.
        mux.dispatch_output(output("old0", "late"));
        assert_eq!(mux.backlog_len(&SessionId::new("old0")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_exit_consumed_once() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        mux.dispatch_exit(exit("s1", 7));
        assert!(mux.has_pending_exit(&s1));

        tokio::time::advance(Duration::from_secs(29)).await;

        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&codes);
        let first = mux.on_session_exit(&s1, move |e| sink.lock().unwrap().push(e.exit_code));
        assert!(!first.is_active());
        assert_eq!(*codes.lock().unwrap(), vec![7]);

        let sink = Arc::clone(&codes);
        let _second = mux.on_session_exit(&s1, move |e| sink.lock().unwrap().push(e.exit_code));
        assert_eq!(*codes.lock().unwrap(), vec![7]);
        assert_eq!(mux.tracked_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_exit_expires() {
        let (_mock, mux) = mux();
        let s1 = SessionId::new("s1");
        mux.dispatch_exit(exit("s1", 7));

        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(!mux.has_pending_exit(&s1));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = mux.on_session_exit(&s1, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_subscribes_exactly_once() {
        let (mock, mux) = mux();
        let other = mux.clone();

        let (a, b) = tokio::join!(mux.init(), other.init());
        a.unwrap();
        b.unwrap();
        mux.init().await.unwrap();

        assert!(mux.is_subscribed());
        assert_eq!(mock.listen_count(OUTPUT_EVENT), 1);
        assert_eq!(mock.listen_count(EXIT_EVENT), 1);
    }

    #[tokio::test]
    async fn test_pump_routes_backend_events() {
        let (mock, mux) = mux();
        mux.init().await.unwrap();
        let s1 = SessionId::new("s1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let out_tx = tx.clone();
        let _out = mux.on_session_output(&s1, move |e| {
            let _ = out_tx.send(format!("out:{}", e.data));
        });
        let _exit = mux.on_session_exit(&s1, move |e| {
            let _ = tx.send(format!("exit:{}", e.exit_code));
        });

        assert!(mock.emit_output("s1", "file.txt\n"));
        assert!(mock.emit_exit("s1", 0));

        assert_eq!(rx.recv().await.unwrap(), "out:file.txt\n");
        assert_eq!(rx.recv().await.unwrap(), "exit:0");
    }

    #[tokio::test]
    async fn test_pump_skips_malformed_payloads() {
        let (mock, mux) = mux();
        mux.init().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _out = mux.on_output(move |e| {
            let _ = tx.send(e.data.clone());
        });

        mock.emit(OUTPUT_EVENT, serde_json::json!({ "nope": true }));
        mock.emit_output("s1", "ok");

        assert_eq!(rx.recv().await.unwrap(), "ok");
    }
}
