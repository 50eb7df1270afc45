//! openspace-bridge: keeps OpenSpace terminal panes attached to backend shell
//! sessions.
//!
//! # Architecture
//!
//! - [`EventMultiplexer`] — One subscription to the backend's output and exit
//!   streams, fanned out to global and per-session listeners. Buffers output
//!   and remembers exits that arrive before anyone listens.
//! - [`SessionRegistry`] — Pane ↔ session mapping, deduplicated creation,
//!   teardown on exit.
//! - [`PaneController`] — Mounts panes onto [`Surface`]s, forwards input,
//!   debounces resizes, and respawns exited sessions while mounted.
//! - [`BridgeConfig`] — Tunables, loaded from the settings store.

pub mod backlog;
pub mod config;
pub mod multiplexer;
pub mod pane;
pub mod registry;
pub mod subscription;
pub mod surface;

pub use backlog::Backlog;
pub use config::BridgeConfig;
pub use multiplexer::{EventMultiplexer, ExitListener, OutputListener};
pub use pane::{AfterExit, Lifecycle, PaneController};
pub use registry::{Liveness, PaneState, PaneStatus, Session, SessionRegistry, VANISHED_EXIT_CODE};
pub use subscription::Subscription;
pub use surface::{Dimensions, GeometryHandler, InputHandler, Surface, SurfaceFactory};
