//! Typed notifications to the embedder
//!
//! Each event is fire-and-forget from the core; the embedder takes the
//! receiver once and drains it at its own pace.

use tokio::sync::mpsc;

use crate::session::Script;

/// Debugger event delivered to the embedder
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// The connect handshake finished and the initial backtrace returned
    ProcessLoaded { running: bool },
    /// Fired exactly once per session, at teardown
    ProcessExited { exit_code: i32 },
    ThreadCreated { thread_id: i64 },
    ModuleLoaded { script: Script },
    /// The debuggee is stopped on the first executable user-code line
    EntryPointHit,
    StepComplete,
    AsyncBreakComplete,
    BreakpointBound {
        engine_id: i64,
        path: String,
        line: u32,
    },
    BreakpointUnbound { engine_id: i64 },
    /// The engine placed the breakpoint somewhere other than requested, or
    /// could not honor its condition there
    BreakpointBindFailure {
        path: String,
        line: u32,
        bound_line: Option<u32>,
    },
    BreakpointHit {
        engine_id: i64,
        path: String,
        line: u32,
    },
    ExceptionRaised {
        name: String,
        description: String,
        uncaught: bool,
    },
}

/// Receiver half handed to the embedder
pub type EventReceiver = mpsc::UnboundedReceiver<DebugEvent>;

#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<DebugEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: DebugEvent) {
        tracing::debug!(?event, "emit");
        let _ = self.tx.send(event);
    }
}
