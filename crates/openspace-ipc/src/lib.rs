//! openspace-ipc: the remote-call boundary between OpenSpace panes and the
//! terminal backend.
//!
//! The backend owns the real shell processes. This crate only knows how to
//! talk to it: which commands exist, what their payloads look like, and how
//! to survive the backend renaming them between versions.
//!
//! # Architecture
//!
//! - [`Transport`] — The seam to the host runtime: invoke a named command,
//!   listen to a named event stream.
//! - [`AliasTable`] — Ordered wire names and payload shapes per [`Operation`].
//! - [`RemoteCallAdapter`] — Tries each alias strategy in order and exposes
//!   typed `create`/`write`/`resize`/`kill`/`list` calls with one error type.
//! - [`wire`] — Request, response, and event payloads.

pub mod adapter;
pub mod alias;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod transport;
pub mod wire;

pub use adapter::RemoteCallAdapter;
pub use alias::{AliasTable, CallStrategy, Operation, PayloadShape};
pub use error::{CallCause, CallError, TransportError};
#[cfg(any(test, feature = "test-support"))]
pub use mock::MockTransport;
pub use transport::{EventStream, Transport, EXIT_EVENT, OUTPUT_EVENT};
pub use wire::{
    CreateRequest, CreateResponse, ExitEvent, KillRequest, OutputEvent, PaneId, ResizeRequest,
    SessionId, WriteRequest,
};
