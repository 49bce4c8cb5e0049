//! Error types for the debug client
//!
//! Wire-level faults, request timeouts and engine rejections are kept as
//! distinct variants so callers can tell "the socket died" apart from "the
//! engine said no".

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debug client
#[derive(Error, Debug)]
pub enum Error {
    // === Transport Errors ===
    #[error("connection to the debuggee closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    // === Request Errors ===
    #[error("request '{command}' timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("request '{command}' abandoned: debuggee is gone")]
    Aborted { command: String },

    #[error("engine rejected '{command}': {message}")]
    CommandFailed { command: String, message: String },

    // === Breakpoint Errors ===
    #[error("breakpoint did not bind at {path}:{line}")]
    BindFailed { path: String, line: u32 },

    #[error("hit-count policies require a count of at least 1")]
    InvalidBreakOn,

    // === Exception Configuration Errors ===
    #[error("break-on-unhandled is not supported by the engine")]
    UnsupportedTreatment,

    // === Session Errors ===
    #[error("cannot {action} while the debuggee is {state}")]
    InvalidState { action: String, state: String },

    #[error("failed to start debuggee: {0}")]
    LaunchFailed(String),

    // === Configuration Errors ===
    #[error("configuration error: {0}")]
    Config(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an engine-rejection error for a command
    pub fn command_failed(command: &str, message: &str) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: &str) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }
}
