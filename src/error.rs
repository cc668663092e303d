use std::time::Duration;

use thiserror::Error;

use crate::halt_point::HaltPointId;
use crate::intercept::InterceptId;
use crate::target::TargetState;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can report.
#[derive(Debug, Error)]
pub enum Error {
    /// A reply that could not be parsed or that did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The debugger answered a command with `^error`.
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The debugger process died or the connection to it was lost.
    #[error("debugger connection lost: {0}")]
    TransportFatal(String),

    /// No result arrived in time. The target is left as it is.
    #[error("no reply from the debugger within {0:?}")]
    Timeout(Duration),

    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),

    #[error("argument type error: {0}")]
    ArgumentType(String),

    /// An intercept or halt point already owns the address.
    #[error("an intercept or halt point is already installed at {0:#010x}")]
    DuplicateIntercept(u32),

    #[error("no intercept point {0}")]
    UnknownIntercept(InterceptId),

    #[error("no halt point {0}")]
    UnknownHaltPoint(HaltPointId),

    #[error("breakpoint {number} at {address:#010x} is not owned by the engine")]
    ConflictingBreakpoint { number: u32, address: u32 },

    #[error("nested debugger requests exceed the limit of {0}")]
    NestingTooDeep(usize),

    /// A forced return was requested after the function started executing.
    #[error("cannot force a return from {address:#010x}: the target already executed up to {pc:#010x}")]
    InterceptTooLate { address: u32, pc: u32 },

    #[error("operation needs a halted target, the target is {0}")]
    TargetState(TargetState),

    #[error("scratch memory exhausted: {requested} bytes requested, {available} available")]
    ScratchExhausted { requested: u32, available: u32 },

    #[error("target stopped unexpectedly at {pc:#010x} ({reason})")]
    UnexpectedStop { pc: u32, reason: String },

    /// An intercept callback failed. The target was resumed regardless.
    #[error("intercept callback at `{location}` failed: {source}")]
    InterceptCallback {
        location: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to read debug information: {0:#}")]
    DebugInfo(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// A timed out request may be repeated, the session is still usable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// The session cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TransportFatal(_))
    }

    /// Maps the message of a `^error` record onto the typed errors the debugger can report.
    pub(crate) fn from_debugger(command: &str, message: &str) -> Error {
        if let Some(rest) = message.strip_prefix("No symbol \"") {
            if let Some(end) = rest.find('"') {
                return Error::UnknownSymbol(rest[..end].to_string());
            }
        }
        if message.starts_with("No symbol table is loaded") {
            return Error::UnknownSymbol(command.to_string());
        }
        Error::CommandFailed {
            command: command.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_unknown_symbol_messages() {
        let err = Error::from_debugger(
            "-data-evaluate-expression \"&nope\"",
            "No symbol \"nope\" in current context.",
        );
        assert!(matches!(err, Error::UnknownSymbol(ref name) if name == "nope"));
    }

    #[test]
    fn other_messages_stay_command_failures() {
        let err = Error::from_debugger(
            "-exec-continue",
            "Cannot execute this command while the target is running.",
        );
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(!err.is_retryable());
        assert!(Error::Timeout(Duration::from_millis(5)).is_retryable());
    }
}
