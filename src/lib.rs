//! Client for the legacy V8/Node.js debug protocol
//!
//! Drives a debuggee over its debug port (default 5858): attach or launch,
//! script discovery, breakpoint binding with location fix-up, stepping,
//! exception filtering, backtrace and variable inspection, expression
//! evaluation, and orderly teardown. The embedder consumes typed
//! [`DebugEvent`]s and calls back into the [`Session`].

pub mod breakpoints;
pub mod common;
pub mod events;
pub mod exceptions;
pub mod inspect;
pub mod launch;
pub mod session;
pub mod testing;
pub mod wire;

pub use breakpoints::{BreakOn, BreakOnKind, Breakpoint, Binding};
pub use common::{Error, Result};
pub use events::{DebugEvent, EventReceiver};
pub use exceptions::ExceptionTreatment;
pub use inspect::{EvaluationResult, ValueKind};
pub use launch::LaunchOptions;
pub use session::{Script, Session, StackFrame, StepKind, DEBUGGEE_THREAD_ID};
