//! Pane runtime: binds a rendered surface to a backend session.
//!
//! Each mounted pane owns one [`Surface`], one ordered input queue drained by
//! its own pump task, and at most one session binding. When the bound
//! session exits the pane prints an exit marker and, if it is still mounted,
//! asks the registry for a fresh session.
//!
//! Every mount gets a new generation number. Handlers and in-flight creations
//! carry the generation they were started under and are ignored once it no
//! longer matches, so a pane that was unmounted (or unmounted and mounted
//! again) never sees results meant for its previous life.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use openspace_ipc::{CallError, ExitEvent, PaneId, SessionId};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::SessionRegistry;
use crate::subscription::Subscription;
use crate::surface::{Dimensions, Surface, SurfaceFactory};

/// Whether a pane is still on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Mounted,
    Disposed,
}

/// What to do after the bound session exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterExit {
    Respawn,
    Stop,
}

impl Lifecycle {
    pub fn after_exit(self) -> AfterExit {
        match self {
            Lifecycle::Mounted => AfterExit::Respawn,
            Lifecycle::Disposed => AfterExit::Stop,
        }
    }
}

enum Binding {
    Unbound,
    Bound {
        session_id: SessionId,
        subscriptions: Vec<Subscription>,
    },
}

struct PaneRuntime {
    slot: usize,
    generation: u64,
    surface: Arc<dyn Surface>,
    binding: Binding,
    input_tx: mpsc::UnboundedSender<(SessionId, String)>,
    resize_task: Option<JoinHandle<()>>,
    handle: Handle,
}

#[derive(Default)]
struct ControllerState {
    panes: HashMap<PaneId, PaneRuntime>,
    next_generation: u64,
}

impl ControllerState {
    fn runtime(&mut self, pane: &PaneId, generation: u64) -> Option<&mut PaneRuntime> {
        self.panes
            .get_mut(pane)
            .filter(|runtime| runtime.generation == generation)
    }
}

struct ControllerInner {
    state: Mutex<ControllerState>,
    registry: SessionRegistry,
    factory: Arc<dyn SurfaceFactory>,
}

/// Mounts panes, forwards their input, and keeps them bound to a session.
///
/// Cheap to clone; clones share the same panes.
#[derive(Clone)]
pub struct PaneController {
    inner: Arc<ControllerInner>,
}

impl PaneController {
    pub fn new(registry: SessionRegistry, factory: Arc<dyn SurfaceFactory>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(ControllerState::default()),
                registry,
                factory,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> Weak<ControllerInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<ControllerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Show `pane` in `slot` and bind it to a session started in `cwd`.
    ///
    /// Mounting a pane that is already mounted does nothing. The pane stays
    /// mounted if session creation fails; the error is returned and the
    /// registry marks the pane as failed.
    pub async fn mount(
        &self,
        pane: &PaneId,
        slot: usize,
        cwd: Option<String>,
    ) -> Result<(), CallError> {
        if self.is_mounted(pane) {
            return Ok(());
        }

        let surface = self.inner.factory.create(pane);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.lock();
            if state.panes.contains_key(pane) {
                drop(state);
                surface.dispose();
                return Ok(());
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.panes.insert(
                pane.clone(),
                PaneRuntime {
                    slot,
                    generation,
                    surface: Arc::clone(&surface),
                    binding: Binding::Unbound,
                    input_tx,
                    resize_task: None,
                    handle: Handle::current(),
                },
            );
            generation
        };

        self.inner
            .registry
            .set_target(pane, cwd, surface.dimensions());
        tokio::spawn(input_pump(
            self.inner.registry.clone(),
            pane.clone(),
            input_rx,
        ));

        let weak = self.downgrade();
        let input_pane = pane.clone();
        surface.on_input(Arc::new(move |data: &str| {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.forward_input(&input_pane, generation, data);
            }
        }));
        let weak = self.downgrade();
        let geometry_pane = pane.clone();
        surface.on_geometry_change(Arc::new(move |dims: Dimensions| {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.schedule_resize(&geometry_pane, generation, dims);
            }
        }));

        log::debug!("mounted pane {pane} in slot {slot} (generation {generation})");
        self.bind(pane, generation).await
    }

    /// Ensure a session for the pane and route its events to the surface.
    async fn bind(&self, pane: &PaneId, generation: u64) -> Result<(), CallError> {
        let session_id = self.inner.registry.ensure_session(pane).await.map_err(|e| {
            log::warn!("pane {pane} could not get a session: {e}");
            e
        })?;

        let surface = {
            let mut state = self.lock();
            let Some(runtime) = state.runtime(pane, generation) else {
                log::debug!("ignoring session {session_id} for disposed pane {pane}");
                return Ok(());
            };
            if let Binding::Bound { session_id: bound, .. } = &runtime.binding {
                if *bound == session_id {
                    return Ok(());
                }
            }
            runtime.binding = Binding::Bound {
                session_id: session_id.clone(),
                subscriptions: Vec::new(),
            };
            Arc::clone(&runtime.surface)
        };

        // Either attach may deliver synchronously, so no lock is held here.
        let events = self.inner.registry.events();
        let output = events.on_session_output(&session_id, move |event| surface.write(&event.data));
        let weak = self.downgrade();
        let exit_pane = pane.clone();
        let exit = events.on_session_exit(&session_id, move |event| {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.handle_exit(&exit_pane, generation, event);
            }
        });

        let rejected = {
            let mut state = self.lock();
            match state.runtime(pane, generation).map(|r| &mut r.binding) {
                Some(Binding::Bound {
                    session_id: bound,
                    subscriptions,
                }) if *bound == session_id => {
                    subscriptions.push(output);
                    subscriptions.push(exit);
                    None
                }
                _ => Some((output, exit)),
            }
        };
        drop(rejected);

        log::debug!("pane {pane} attached to session {session_id}");
        Ok(())
    }

    fn handle_exit(&self, pane: &PaneId, generation: u64, event: &ExitEvent) {
        let (surface, subscriptions, handle) = {
            let mut state = self.lock();
            let Some(runtime) = state.runtime(pane, generation) else {
                return;
            };
            match &runtime.binding {
                Binding::Bound { session_id, .. } if *session_id == event.session_id => {}
                _ => return,
            }
            let subscriptions = match std::mem::replace(&mut runtime.binding, Binding::Unbound) {
                Binding::Bound { subscriptions, .. } => subscriptions,
                Binding::Unbound => Vec::new(),
            };
            (
                Arc::clone(&runtime.surface),
                subscriptions,
                runtime.handle.clone(),
            )
        };
        drop(subscriptions);

        surface.write(&exit_marker(event.exit_code));

        match self.lifecycle_of(pane, generation).after_exit() {
            AfterExit::Respawn => {
                log::info!("session {} of pane {pane} exited; respawning", event.session_id);
                let controller = self.clone();
                let pane = pane.clone();
                handle.spawn(async move {
                    if let Err(e) = controller.bind(&pane, generation).await {
                        log::warn!("respawn for pane {pane} failed: {e}");
                    }
                });
            }
            AfterExit::Stop => {
                log::debug!("session {} of pane {pane} exited", event.session_id);
            }
        }
    }

    fn forward_input(&self, pane: &PaneId, generation: u64, data: &str) {
        let mut state = self.lock();
        let Some(runtime) = state.runtime(pane, generation) else {
            return;
        };
        match &runtime.binding {
            Binding::Bound { session_id, .. } => {
                if runtime
                    .input_tx
                    .send((session_id.clone(), data.to_string()))
                    .is_err()
                {
                    log::debug!("input queue for pane {pane} is closed");
                }
            }
            Binding::Unbound => log::debug!("dropping input for unbound pane {pane}"),
        }
    }

    /// Restart the one-frame resize timer with the latest geometry.
    fn schedule_resize(&self, pane: &PaneId, generation: u64, dims: Dimensions) {
        let registry = self.inner.registry.clone();
        let frame = registry.config().frame_interval();
        let mut state = self.lock();
        let Some(runtime) = state.runtime(pane, generation) else {
            return;
        };
        if let Some(pending) = runtime.resize_task.take() {
            pending.abort();
        }
        let pane = pane.clone();
        runtime.resize_task = Some(runtime.handle.spawn(async move {
            tokio::time::sleep(frame).await;
            if let Err(e) = registry.resize_pane(&pane, dims).await {
                log::warn!("resize of pane {pane} failed: {e}");
            }
        }));
    }

    /// Take the pane off screen but keep its session running.
    ///
    /// Output produced meanwhile is buffered and shown when the pane is
    /// mounted again.
    pub fn detach(&self, pane: &PaneId) -> bool {
        let Some(runtime) = self.lock().panes.remove(pane) else {
            return false;
        };
        if let Some(pending) = &runtime.resize_task {
            pending.abort();
        }
        runtime.surface.dispose();
        log::debug!("detached pane {pane} (generation {})", runtime.generation);
        // Dropping the runtime unsubscribes and closes the input queue.
        drop(runtime);
        true
    }

    /// Take the pane off screen and kill its session.
    pub async fn unmount(&self, pane: &PaneId) -> Result<(), CallError> {
        self.detach(pane);
        self.inner.registry.release_pane(pane).await
    }

    /// Unmount every pane whose slot is `count` or higher. Returns them.
    pub async fn set_visible_count(&self, count: usize) -> Vec<PaneId> {
        let hidden: Vec<PaneId> = self
            .lock()
            .panes
            .iter()
            .filter(|(_, runtime)| runtime.slot >= count)
            .map(|(pane, _)| pane.clone())
            .collect();

        for pane in &hidden {
            if let Err(e) = self.unmount(pane).await {
                log::warn!("failed to release hidden pane {pane}: {e}");
            }
        }
        hidden
    }

    pub fn is_mounted(&self, pane: &PaneId) -> bool {
        self.lock().panes.contains_key(pane)
    }

    pub fn lifecycle(&self, pane: &PaneId) -> Lifecycle {
        if self.is_mounted(pane) {
            Lifecycle::Mounted
        } else {
            Lifecycle::Disposed
        }
    }

    fn lifecycle_of(&self, pane: &PaneId, generation: u64) -> Lifecycle {
        match self.lock().runtime(pane, generation) {
            Some(_) => Lifecycle::Mounted,
            None => Lifecycle::Disposed,
        }
    }

    /// Session the pane's surface is currently attached to.
    pub fn bound_session(&self, pane: &PaneId) -> Option<SessionId> {
        match &self.lock().panes.get(pane)?.binding {
            Binding::Bound { session_id, .. } => Some(session_id.clone()),
            Binding::Unbound => None,
        }
    }

    pub fn mounted_panes(&self) -> Vec<PaneId> {
        let mut panes: Vec<(usize, PaneId)> = self
            .lock()
            .panes
            .iter()
            .map(|(pane, runtime)| (runtime.slot, pane.clone()))
            .collect();
        panes.sort();
        panes.into_iter().map(|(_, pane)| pane).collect()
    }
}

fn exit_marker(exit_code: i32) -> String {
    format!("\r\n[process exited with code {exit_code}]\r\n")
}

/// Send a pane's input to the backend one chunk at a time, in order.
async fn input_pump(
    registry: SessionRegistry,
    pane: PaneId,
    mut rx: mpsc::UnboundedReceiver<(SessionId, String)>,
) {
    while let Some((session_id, data)) = rx.recv().await {
        if let Err(e) = registry.write(&session_id, &data).await {
            log::warn!("input for pane {pane} lost: {e}");
        }
    }
    log::debug!("input pump for pane {pane} stopped");
}
