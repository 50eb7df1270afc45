use thiserror::Error;

use crate::alias::Operation;

/// Errors raised by a [`Transport`](crate::Transport) for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The host runtime has no command registered under this name.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    /// The command ran and returned an error.
    #[error("{0}")]
    Rejected(String),
    /// The transport is shut down.
    #[error("transport closed")]
    Closed,
}

/// Why an aliased call failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallCause {
    /// The last error seen after every alias strategy was tried.
    #[error("{0}")]
    Transport(#[from] TransportError),
    /// The request could not be serialized.
    #[error("could not encode request: {0}")]
    Encode(String),
    /// The backend answered but the response did not match the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
    /// The alias table lists no strategy for the operation.
    #[error("no command names configured")]
    NoStrategies,
    /// The task driving the call panicked or was aborted.
    #[error("call task aborted")]
    TaskAborted,
}

/// The single failure shape of every backend call.
///
/// `Clone` so that one creation result can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("terminal {operation} failed: {cause}")]
pub struct CallError {
    pub operation: Operation,
    pub cause: CallCause,
}

impl CallError {
    pub fn new(operation: Operation, cause: impl Into<CallCause>) -> Self {
        Self {
            operation,
            cause: cause.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_display() {
        let err = CallError::new(
            Operation::Create,
            TransportError::Rejected("failed to open PTY".into()),
        );
        assert_eq!(err.to_string(), "terminal create failed: failed to open PTY");
    }

    #[test]
    fn test_unknown_command_display() {
        let err = CallError::new(
            Operation::Kill,
            TransportError::UnknownCommand("terminal_kill".into()),
        );
        assert_eq!(
            err.to_string(),
            "terminal kill failed: unknown command `terminal_kill`"
        );
    }

    #[test]
    fn test_encode_and_decode_are_distinct() {
        let encode = CallError::new(Operation::Write, CallCause::Encode("bad key".into()));
        let decode = CallError::new(Operation::Write, CallCause::Decode("bad key".into()));
        assert_eq!(
            encode.to_string(),
            "terminal write failed: could not encode request: bad key"
        );
        assert_eq!(
            decode.to_string(),
            "terminal write failed: malformed response: bad key"
        );
    }
}
