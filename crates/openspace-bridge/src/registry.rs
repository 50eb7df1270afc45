//! Pane ↔ session bookkeeping.
//!
//! The registry owns the only mapping between UI panes and backend sessions.
//! It creates sessions on demand, deduplicates concurrent creation per pane,
//! and forgets a session synchronously with its exit event.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use openspace_ipc::{
    CallCause, CallError, CreateRequest, ExitEvent, KillRequest, Operation, PaneId,
    RemoteCallAdapter, ResizeRequest, SessionId, Transport, WriteRequest,
};

use crate::config::BridgeConfig;
use crate::multiplexer::EventMultiplexer;
use crate::subscription::Subscription;
use crate::surface::Dimensions;

/// Exit code reported for sessions the backend lost without an exit event.
pub const VANISHED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Exited,
}

/// A backend shell process known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub pid: u32,
    pub cwd: Option<String>,
    pub liveness: Liveness,
}

/// Outcome of the last thing a pane did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaneStatus {
    #[default]
    Idle,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneState {
    Unbound,
    Creating,
    Bound(SessionId),
    /// The last creation attempt failed.
    Error,
}

#[derive(Debug, Clone)]
struct PaneTarget {
    cwd: Option<String>,
    dims: Dimensions,
}

type PendingCreate = Shared<BoxFuture<'static, Result<SessionId, CallError>>>;

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    pane_to_session: HashMap<PaneId, SessionId>,
    session_to_pane: HashMap<SessionId, PaneId>,
    pending: HashMap<PaneId, PendingCreate>,
    /// Panes released while their creation was in flight.
    doomed: HashSet<PaneId>,
    failed: HashSet<PaneId>,
    targets: HashMap<PaneId, PaneTarget>,
    statuses: HashMap<PaneId, PaneStatus>,
}

impl RegistryState {
    /// Drop every trace of `session_id`. Returns the record and its pane.
    fn forget(&mut self, session_id: &SessionId) -> (Option<Session>, Option<PaneId>) {
        let session = self.sessions.remove(session_id);
        let pane = self.session_to_pane.remove(session_id);
        if let Some(pane) = &pane {
            if self.pane_to_session.get(pane) == Some(session_id) {
                self.pane_to_session.remove(pane);
            }
        }
        (session, pane)
    }

    fn mark_error(&mut self, session_id: &SessionId) {
        if let Some(pane) = self.session_to_pane.get(session_id) {
            self.statuses.insert(pane.clone(), PaneStatus::Error);
        }
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    adapter: RemoteCallAdapter,
    events: EventMultiplexer,
    config: BridgeConfig,
    _exit_subscription: Subscription,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_exit(&self, event: &ExitEvent) {
        let (session, pane) = {
            let mut state = self.lock();
            let (session, pane) = state.forget(&event.session_id);
            if let Some(pane) = &pane {
                let status = if event.exit_code == 0 {
                    PaneStatus::Success
                } else {
                    PaneStatus::Error
                };
                state.statuses.insert(pane.clone(), status);
            }
            (session, pane)
        };

        match (session, pane) {
            (Some(session), Some(pane)) => log::info!(
                "session {} (pid {}) for pane {pane} exited with code {}",
                session.id,
                session.pid,
                event.exit_code
            ),
            (Some(session), None) => log::debug!("unbound session {} exited", session.id),
            _ => {}
        }
    }
}

/// Creates, tracks, and tears down backend sessions for panes.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(adapter: RemoteCallAdapter, events: EventMultiplexer, config: BridgeConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let weak = weak.clone();
            let exit_subscription = events.on_exit(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_exit(event);
                }
            });
            RegistryInner {
                state: Mutex::new(RegistryState::default()),
                adapter,
                events,
                config,
                _exit_subscription: exit_subscription,
            }
        });
        Self { inner }
    }

    /// Build the adapter and multiplexer over `transport` with default aliases.
    pub fn connect(transport: Arc<dyn Transport>, config: BridgeConfig) -> Self {
        let events = EventMultiplexer::new(Arc::clone(&transport), &config);
        Self::new(RemoteCallAdapter::new(transport), events, config)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock()
    }

    pub fn events(&self) -> &EventMultiplexer {
        &self.inner.events
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Return the pane's session, creating one if needed.
    ///
    /// Concurrent callers for the same pane share a single create call and
    /// all observe its result. A failed creation leaves the pane in
    /// [`PaneState::Error`]; calling again retries.
    ///
    /// If the pane is released while creation is in flight the new session
    /// is killed as soon as it exists and its id is still returned here, but
    /// it is never bound.
    pub async fn ensure_session(&self, pane: &PaneId) -> Result<SessionId, CallError> {
        self.inner
            .events
            .init()
            .await
            .map_err(|e| CallError::new(Operation::Create, e))?;

        let pending = {
            let mut state = self.lock();
            if let Some(session_id) = state.pane_to_session.get(pane) {
                return Ok(session_id.clone());
            }
            // Asking again revives a creation doomed by an earlier release.
            state.doomed.remove(pane);
            let in_flight = state.pending.get(pane).cloned();
            match in_flight {
                Some(pending) => pending,
                None => {
                    let request = self.create_request(&state, pane);
                    state.failed.remove(pane);

                    log::debug!("creating session for pane {pane}");
                    let task = tokio::spawn(create_session(
                        Arc::clone(&self.inner),
                        pane.clone(),
                        request,
                    ));
                    let pending = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| {
                                log::error!("session creation task failed: {e}");
                                Err(CallError::new(Operation::Create, CallCause::TaskAborted))
                            })
                        })
                        .boxed()
                        .shared();
                    state.pending.insert(pane.clone(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    fn create_request(&self, state: &RegistryState, pane: &PaneId) -> CreateRequest {
        let config = &self.inner.config;
        let (cwd, dims) = match state.targets.get(pane) {
            Some(target) => (target.cwd.clone(), target.dims),
            None => (None, Dimensions::new(config.default_cols, config.default_rows)),
        };
        CreateRequest {
            cwd,
            cols: config.clamp_dimension(dims.cols),
            rows: config.clamp_dimension(dims.rows),
            shell: None,
            args: None,
        }
    }

    /// Send input to a session. Unknown sessions are ignored.
    pub async fn write(&self, session_id: &SessionId, data: &str) -> Result<(), CallError> {
        if !self.is_known(session_id) {
            log::debug!("dropping write to unknown session {session_id}");
            return Ok(());
        }
        let request = WriteRequest {
            session_id: session_id.clone(),
            data: data.to_string(),
        };
        self.inner.adapter.write(&request).await.map_err(|e| {
            log::warn!("write to session {session_id} failed: {e}");
            self.lock().mark_error(session_id);
            e
        })
    }

    /// Resize a session, flooring both dimensions. Unknown sessions are ignored.
    pub async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), CallError> {
        if !self.is_known(session_id) {
            log::debug!("dropping resize of unknown session {session_id}");
            return Ok(());
        }
        let config = &self.inner.config;
        let request = ResizeRequest {
            session_id: session_id.clone(),
            cols: config.clamp_dimension(cols),
            rows: config.clamp_dimension(rows),
        };
        self.inner.adapter.resize(&request).await.map_err(|e| {
            log::warn!("resize of session {session_id} failed: {e}");
            self.lock().mark_error(session_id);
            e
        })
    }

    /// Record new geometry for the pane and resize its session, if any.
    pub async fn resize_pane(&self, pane: &PaneId, dims: Dimensions) -> Result<(), CallError> {
        let bound = {
            let mut state = self.lock();
            state
                .targets
                .entry(pane.clone())
                .and_modify(|target| target.dims = dims)
                .or_insert(PaneTarget { cwd: None, dims });
            state.pane_to_session.get(pane).cloned()
        };
        match bound {
            Some(session_id) => self.resize(&session_id, dims.cols, dims.rows).await,
            None => Ok(()),
        }
    }

    /// Kill a session. It is forgotten locally even if the backend call fails.
    pub async fn kill(&self, session_id: &SessionId) -> Result<(), CallError> {
        let (session, pane) = self.lock().forget(session_id);
        if session.is_some() {
            log::debug!(
                "killing session {session_id}{}",
                pane.map(|p| format!(" of pane {p}")).unwrap_or_default()
            );
        }
        self.send_kill(session_id).await
    }

    async fn send_kill(&self, session_id: &SessionId) -> Result<(), CallError> {
        let request = KillRequest {
            session_id: session_id.clone(),
            signal: None,
        };
        self.inner.adapter.kill(&request).await
    }

    /// Drop the pane: kill its session, or doom an in-flight creation.
    pub async fn release_pane(&self, pane: &PaneId) -> Result<(), CallError> {
        let bound = {
            let mut state = self.lock();
            state.targets.remove(pane);
            state.statuses.remove(pane);
            state.failed.remove(pane);
            let bound = state.pane_to_session.get(pane).cloned();
            match &bound {
                Some(session_id) => {
                    state.forget(session_id);
                }
                None if state.pending.contains_key(pane) => {
                    log::debug!("pane {pane} released during creation");
                    state.doomed.insert(pane.clone());
                }
                None => {}
            }
            bound
        };
        match bound {
            Some(session_id) => self.send_kill(&session_id).await,
            None => Ok(()),
        }
    }

    /// Ids of every session the backend currently holds.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, CallError> {
        self.inner.adapter.list().await
    }

    /// Retire local sessions the backend no longer has.
    ///
    /// Each one goes through the exit path with [`VANISHED_EXIT_CODE`], so
    /// listeners see it end exactly as if the backend had reported it.
    /// Returns the retired records.
    pub async fn reconcile(&self) -> Result<Vec<Session>, CallError> {
        let live: HashSet<SessionId> = self.list_sessions().await?.into_iter().collect();
        let stale: Vec<Session> = self
            .lock()
            .sessions
            .values()
            .filter(|s| !live.contains(&s.id))
            .cloned()
            .collect();

        let mut retired = Vec::with_capacity(stale.len());
        for mut session in stale {
            log::info!("session {} vanished from the backend", session.id);
            self.inner.events.dispatch_exit(ExitEvent {
                session_id: session.id.clone(),
                exit_code: VANISHED_EXIT_CODE,
                signal: None,
            });
            session.liveness = Liveness::Exited;
            retired.push(session);
        }
        Ok(retired)
    }

    /// Set the working directory and geometry used by the pane's next creation.
    pub fn set_target(&self, pane: &PaneId, cwd: Option<String>, dims: Dimensions) {
        self.lock()
            .targets
            .insert(pane.clone(), PaneTarget { cwd, dims });
    }

    pub fn session_for(&self, pane: &PaneId) -> Option<SessionId> {
        self.lock().pane_to_session.get(pane).cloned()
    }

    pub fn pane_for(&self, session_id: &SessionId) -> Option<PaneId> {
        self.lock().session_to_pane.get(session_id).cloned()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn pane_state(&self, pane: &PaneId) -> PaneState {
        let state = self.lock();
        if let Some(session_id) = state.pane_to_session.get(pane) {
            PaneState::Bound(session_id.clone())
        } else if state.pending.contains_key(pane) {
            PaneState::Creating
        } else if state.failed.contains(pane) {
            PaneState::Error
        } else {
            PaneState::Unbound
        }
    }

    pub fn status(&self, pane: &PaneId) -> PaneStatus {
        self.lock().statuses.get(pane).copied().unwrap_or_default()
    }

    fn is_known(&self, session_id: &SessionId) -> bool {
        self.lock().sessions.contains_key(session_id)
    }
}

/// Body of the spawned create call. Runs its bookkeeping exactly once.
async fn create_session(
    inner: Arc<RegistryInner>,
    pane: PaneId,
    request: CreateRequest,
) -> Result<SessionId, CallError> {
    let result = inner.adapter.create(&request).await;

    let mut orphan = None;
    let outcome = {
        let mut state = inner.lock();
        state.pending.remove(&pane);
        let doomed = state.doomed.remove(&pane);

        match result {
            Ok(response) => {
                let session_id = response.session_id;
                if doomed {
                    orphan = Some(session_id.clone());
                } else if inner.events.has_exited(&session_id) {
                    log::warn!("session {session_id} exited before pane {pane} could bind it");
                } else {
                    state.sessions.insert(
                        session_id.clone(),
                        Session {
                            id: session_id.clone(),
                            pid: response.pid,
                            cwd: request.cwd.clone(),
                            liveness: Liveness::Active,
                        },
                    );
                    state.pane_to_session.insert(pane.clone(), session_id.clone());
                    state.session_to_pane.insert(session_id.clone(), pane.clone());
                    state.statuses.insert(pane.clone(), PaneStatus::Idle);
                    log::info!(
                        "pane {pane} bound to session {session_id} (pid {})",
                        response.pid
                    );
                }
                Ok(session_id)
            }
            Err(e) => {
                if !doomed {
                    state.failed.insert(pane.clone());
                    state.statuses.insert(pane.clone(), PaneStatus::Error);
                }
                log::warn!("creating session for pane {pane} failed: {e}");
                Err(e)
            }
        }
    };

    if let Some(session_id) = orphan {
        log::debug!("killing session {session_id} created for released pane {pane}");
        let request = KillRequest {
            session_id: session_id.clone(),
            signal: None,
        };
        if let Err(e) = inner.adapter.kill(&request).await {
            log::warn!("failed to kill orphaned session {session_id}: {e}");
        }
    }
    outcome
}
