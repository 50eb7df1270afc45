//! Alias-tolerant calls into the terminal backend.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::alias::{AliasTable, Operation};
use crate::error::{CallCause, CallError, TransportError};
use crate::transport::Transport;
use crate::wire::{
    CreateRequest, CreateResponse, KillRequest, ResizeRequest, SessionId, WriteRequest,
};

/// Resolves each [`Operation`] through an [`AliasTable`] and invokes it.
///
/// Strategies are tried strictly in table order and the first success wins.
/// When every strategy fails, the last error seen is returned. There is no
/// retry or timeout here; both belong to the transport.
pub struct RemoteCallAdapter {
    transport: Arc<dyn Transport>,
    aliases: AliasTable,
}

impl RemoteCallAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_aliases(transport, AliasTable::default())
    }

    pub fn with_aliases(transport: Arc<dyn Transport>, aliases: AliasTable) -> Self {
        Self { transport, aliases }
    }

    /// Invoke `operation` with `payload`, trying every alias strategy in order.
    pub async fn call(&self, operation: Operation, payload: Value) -> Result<Value, CallError> {
        let strategies = self.aliases.strategies(operation);
        let mut last_error: Option<TransportError> = None;

        for (attempt, strategy) in strategies.iter().enumerate() {
            let args = strategy.shape.apply(&payload);
            match self.transport.invoke(&strategy.command, args).await {
                Ok(value) => {
                    if attempt > 0 {
                        log::info!(
                            "{operation} resolved via alias `{}` ({:?}) after {attempt} failed attempt(s)",
                            strategy.command,
                            strategy.shape,
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    log::debug!(
                        "{operation} attempt `{}` ({:?}) failed: {e}",
                        strategy.command,
                        strategy.shape,
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => {
                log::warn!(
                    "{operation} failed after {} strategies: {e}",
                    strategies.len()
                );
                Err(CallError::new(operation, e))
            }
            None => Err(CallError::new(operation, CallCause::NoStrategies)),
        }
    }

    async fn call_typed<Req, Resp>(&self, operation: Operation, request: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let value = self.call(operation, to_payload(operation, request)?).await?;
        serde_json::from_value(value)
            .map_err(|e| CallError::new(operation, CallCause::Decode(e.to_string())))
    }

    /// Create a session. Returns the backend-assigned id and pid.
    pub async fn create(&self, request: &CreateRequest) -> Result<CreateResponse, CallError> {
        self.call_typed(Operation::Create, request).await
    }

    pub async fn write(&self, request: &WriteRequest) -> Result<(), CallError> {
        self.call(Operation::Write, to_payload(Operation::Write, request)?)
            .await
            .map(drop)
    }

    pub async fn resize(&self, request: &ResizeRequest) -> Result<(), CallError> {
        self.call(Operation::Resize, to_payload(Operation::Resize, request)?)
            .await
            .map(drop)
    }

    pub async fn kill(&self, request: &KillRequest) -> Result<(), CallError> {
        self.call(Operation::Kill, to_payload(Operation::Kill, request)?)
            .await
            .map(drop)
    }

    /// Ids of every session the backend currently holds.
    pub async fn list(&self) -> Result<Vec<SessionId>, CallError> {
        let value = self.call(Operation::List, json!({})).await?;
        serde_json::from_value(value)
            .map_err(|e| CallError::new(Operation::List, CallCause::Decode(e.to_string())))
    }
}

fn to_payload<T: Serialize>(operation: Operation, request: &T) -> Result<Value, CallError> {
    serde_json::to_value(request)
        .map_err(|e| CallError::new(operation, CallCause::Encode(e.to_string())))
}
