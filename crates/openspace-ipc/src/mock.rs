//! In-memory [`Transport`] for tests.
//!
//! `MockTransport::terminal_backend()` answers the canonical commands with
//! the `{ "request": ... }` argument layout, hands out sequential session ids
//! (`s1`, `s2`, ...), and tracks which sessions are live. Tests can override
//! any command, hold a command until released, and emit events.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::error::TransportError;
use crate::transport::{EventStream, Transport, EXIT_EVENT, OUTPUT_EVENT};

type Responder = Box<dyn FnMut(&Value) -> Result<Value, TransportError> + Send>;

#[derive(Default)]
struct MockState {
    builtin: bool,
    calls: Vec<(String, Value)>,
    responders: HashMap<String, Responder>,
    gates: HashMap<String, Arc<Notify>>,
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    live: BTreeSet<String>,
    created: u32,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// A transport that knows no commands at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport emulating the current terminal backend.
    pub fn terminal_backend() -> Self {
        let mock = Self::new();
        mock.lock().builtin = true;
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `command` with `responder` instead of the built-in behavior.
    pub fn respond<F>(&self, command: &str, responder: F)
    where
        F: FnMut(&Value) -> Result<Value, TransportError> + Send + 'static,
    {
        self.lock()
            .responders
            .insert(command.to_string(), Box::new(responder));
    }

    /// Make `command` reject every call with `message`.
    pub fn fail(&self, command: &str, message: &str) {
        let message = message.to_string();
        self.respond(command, move |_| Err(TransportError::Rejected(message.clone())));
    }

    /// Hold every call to `command` until the returned handle is notified
    /// once per call.
    pub fn gate(&self, command: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.lock()
            .gates
            .insert(command.to_string(), Arc::clone(&notify));
        notify
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.lock().calls.clone()
    }

    /// How many times `command` was invoked.
    pub fn calls_to(&self, command: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(name, _)| name == command)
            .count()
    }

    /// Session ids created and not yet killed.
    pub fn live_sessions(&self) -> Vec<String> {
        self.lock().live.iter().cloned().collect()
    }

    /// Number of open streams for `event`.
    pub fn listen_count(&self, event: &str) -> usize {
        self.lock()
            .listeners
            .get(event)
            .map(|senders| senders.len())
            .unwrap_or(0)
    }

    /// Emit a raw payload on `event`. Returns `false` if nobody listens.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        let mut state = self.lock();
        let Some(senders) = state.listeners.get_mut(event) else {
            return false;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        !senders.is_empty()
    }

    pub fn emit_output(&self, session_id: &str, data: &str) -> bool {
        self.emit(
            OUTPUT_EVENT,
            json!({ "sessionId": session_id, "data": data }),
        )
    }

    pub fn emit_exit(&self, session_id: &str, exit_code: i32) -> bool {
        self.lock().live.remove(session_id);
        self.emit(
            EXIT_EVENT,
            json!({ "sessionId": session_id, "exitCode": exit_code, "signal": null }),
        )
    }

    fn builtin(state: &mut MockState, command: &str, args: &Value) -> Result<Value, TransportError> {
        let request = || {
            args.get("request").ok_or_else(|| {
                TransportError::Rejected(format!(
                    "command {command} missing required key request"
                ))
            })
        };
        let session_of = |request: &Value| {
            request
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        let not_found =
            |id: &str| TransportError::Rejected(format!("Terminal session \"{id}\" was not found."));

        match command {
            "terminal_create" => {
                request()?;
                state.created += 1;
                let id = format!("s{}", state.created);
                state.live.insert(id.clone());
                Ok(json!({ "sessionId": id, "pid": 41 + state.created }))
            }
            "terminal_write" | "terminal_resize" => {
                let id = session_of(request()?);
                if state.live.contains(&id) {
                    Ok(Value::Null)
                } else {
                    Err(not_found(&id))
                }
            }
            "terminal_kill" => {
                let id = session_of(request()?);
                if state.live.remove(&id) {
                    Ok(Value::Null)
                } else {
                    Err(not_found(&id))
                }
            }
            "terminal_list" => Ok(json!(state.live.iter().collect::<Vec<_>>())),
            _ => Err(TransportError::UnknownCommand(command.to_string())),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, TransportError> {
        let gate = {
            let mut state = self.lock();
            state.calls.push((command.to_string(), args.clone()));
            state.gates.get(command).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.lock();
        if let Some(responder) = state.responders.get_mut(command) {
            return responder(&args);
        }
        if !state.builtin {
            return Err(TransportError::UnknownCommand(command.to_string()));
        }
        Self::builtin(&mut state, command, &args)
    }

    async fn listen(&self, event: &str) -> Result<EventStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
