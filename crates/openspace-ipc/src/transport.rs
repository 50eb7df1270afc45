//! The seam to the host runtime's remote-procedure and event primitives.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Event carrying [`OutputEvent`](crate::OutputEvent) payloads.
pub const OUTPUT_EVENT: &str = "terminal:output";

/// Event carrying [`ExitEvent`](crate::ExitEvent) payloads.
pub const EXIT_EVENT: &str = "terminal:exit";

/// Raw event payloads, in the order the backend emitted them.
pub type EventStream = mpsc::UnboundedReceiver<Value>;

/// A host runtime that can run named commands and stream named events.
///
/// Implementations must not reorder payloads within one event stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke `command` with `args` and return its JSON result.
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, TransportError>;

    /// Start listening to `event`. Each call opens an independent stream.
    async fn listen(&self, event: &str) -> Result<EventStream, TransportError>;
}
