//! Debug session lifecycle
//!
//! One `Session` owns one debuggee: the socket, the optional launched
//! process, the script inventory, breakpoint bindings, exception treatments
//! and stepping state. A dedicated listener task reads the socket; event
//! handling is serialized through a dispatcher mailbox so stops are processed
//! in wire order.

mod listener;
mod stops;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::breakpoints::Binding;
use crate::common::config::ClientConfig;
use crate::common::{Error, Result};
use crate::events::{DebugEvent, EventReceiver, EventSink};
use crate::exceptions::ExceptionTable;
use crate::inspect::EvaluationResult;
use crate::launch::LaunchOptions;
use crate::wire::types::ScriptRecord;
use crate::wire::Router;

pub use stops::StepKind;

/// The engine is single-threaded; the sole debuggee thread has this id.
pub const DEBUGGEE_THREAD_ID: i64 = 1;

/// An engine-known source unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub id: i64,
    pub name: String,
}

impl Script {
    /// Sentinel for frames whose script cannot be resolved
    pub(crate) fn unknown() -> Self {
        Self {
            id: -1,
            name: "<unknown>".to_string(),
        }
    }
}

/// Snapshot of one stack frame, re-created on every backtrace
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub index: u32,
    pub script: Script,
    pub function: String,
    /// 1-based
    pub line: u32,
    pub parameters: Vec<EvaluationResult>,
    pub locals: Vec<EvaluationResult>,
}

/// Stepping state carried across stops
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SteppingState {
    pub mode: Option<StepKind>,
    /// Frame count observed when the step was initiated
    pub frame_depth: usize,
    /// Set once a stop was swallowed and the step is being resumed
    pub resuming: bool,
}

/// Mutable session state, guarded by one mutex
///
/// Both the dispatcher task and API callers touch these maps; a single lock
/// keeps the ordering honest. The guard is never held across an await.
pub(crate) struct SessionState {
    /// Script inventory, keyed by lowercased name
    pub scripts: HashMap<String, Script>,
    /// Live bindings by engine breakpoint id
    pub bindings: HashMap<i64, Binding>,
    pub exceptions: ExceptionTable,
    /// `code` property handle -> error code string
    pub error_codes: HashMap<i64, String>,
    pub stepping: SteppingState,
    /// The sole thread's frame vector, replaced atomically per backtrace
    pub frames: Vec<StackFrame>,
    pub load_complete_handled: bool,
    pub handle_entry_point_hit: bool,
    pub running: bool,
    pub terminated: bool,
    pub detached: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            bindings: HashMap::new(),
            exceptions: ExceptionTable::with_defaults(),
            error_codes: HashMap::new(),
            stepping: SteppingState::default(),
            frames: Vec::new(),
            load_complete_handled: false,
            handle_entry_point_hit: false,
            running: true,
            terminated: false,
            detached: false,
        }
    }

    pub fn script_by_path(&self, path: &str) -> Option<&Script> {
        self.scripts.get(&path.to_lowercase())
    }

    pub fn script_by_id(&self, id: i64) -> Option<Script> {
        self.scripts.values().find(|s| s.id == id).cloned()
    }
}

/// A debug session over one engine connection
pub struct Session {
    pub(crate) router: Router,
    state: StdMutex<SessionState>,
    pub(crate) events: EventSink,
    pub(crate) shutdown: CancellationToken,
    /// Launched debuggee, if this session launched one
    process: Mutex<Option<Child>>,
    /// Serializes teardown
    teardown: Mutex<()>,
    /// True when attached to an already-running process
    pub(crate) attached: bool,
    config: ClientConfig,
}

impl Session {
    /// Connect to a debuggee's debug port
    ///
    /// Pass the launched process handle when this client started the
    /// debuggee; `None` means attach. Events begin flowing once the engine
    /// sends its handshake packet; the caller should wait for
    /// [`DebugEvent::ProcessLoaded`] before driving the session.
    pub async fn connect(
        config: ClientConfig,
        process: Option<Child>,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let _ = stream.set_nodelay(true);
        Self::over(stream, process, config)
    }

    /// Launch a script under the debugger, then connect
    pub async fn launch(
        mut config: ClientConfig,
        mut options: LaunchOptions,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        if options.node_exe.is_none() {
            options.node_exe = config.node.clone();
        }
        config.port = options.port;
        let child = crate::launch::spawn_debuggee(&options)?;

        // The interpreter needs a moment to open its debug port.
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(config.timeouts.connect_ms);
        let stream = loop {
            match TcpStream::connect((config.host.as_str(), config.port)).await {
                Ok(stream) => break stream,
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::LaunchFailed(format!(
                            "debug port {} never opened: {err}",
                            config.port
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };
        let _ = stream.set_nodelay(true);
        Self::over(stream, Some(child), config)
    }

    fn over(
        stream: TcpStream,
        process: Option<Child>,
        config: ClientConfig,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        let (read_half, write_half) = stream.into_split();
        let shutdown = CancellationToken::new();
        let (events, event_rx) = EventSink::channel();

        let session = Arc::new(Self {
            router: Router::new(write_half, shutdown.clone()),
            state: StdMutex::new(SessionState::new()),
            events,
            shutdown,
            attached: process.is_none(),
            process: Mutex::new(process),
            teardown: Mutex::new(()),
            config,
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(listener::read_loop(read_half, session.clone(), inbound_tx));
        tokio::spawn(listener::dispatch_loop(session.clone(), inbound_rx));

        Ok((session, event_rx))
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn sync_timeout(&self) -> Duration {
        self.config.sync_timeout()
    }

    /// Short-circuit predicate for synchronous waits
    pub fn has_exited(&self) -> bool {
        self.shutdown.is_cancelled() || self.state().terminated
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Snapshot of the current frame vector
    pub fn frames(&self) -> Vec<StackFrame> {
        self.state().frames.clone()
    }

    /// Snapshot of the script inventory
    pub fn scripts(&self) -> Vec<Script> {
        self.state().scripts.values().cloned().collect()
    }

    /// Look up a script by its path, compared case-insensitively
    pub fn find_script(&self, path: &str) -> Option<Script> {
        self.state().script_by_path(path).cloned()
    }

    /// Connect handshake: inventory, exception configuration, first backtrace
    pub(crate) async fn process_connect(&self) -> Result<()> {
        self.events.emit(DebugEvent::ThreadCreated {
            thread_id: DEBUGGEE_THREAD_ID,
        });

        let response = self.router.request("scripts", None).await?;
        if let Some(scripts) = response.body.as_ref().and_then(serde_json::Value::as_array) {
            for record in scripts {
                let Ok(record) = serde_json::from_value::<ScriptRecord>(record.clone()) else {
                    continue;
                };
                let Some(name) = record.name else { continue };
                self.add_script(Script {
                    id: record.id,
                    name,
                });
            }
        }

        self.sync_exception_break(true).await?;

        let running = self.perform_backtrace().await?;
        self.events.emit(DebugEvent::ProcessLoaded { running });
        Ok(())
    }

    /// Index a discovered script; emits `ModuleLoaded` for new ones
    ///
    /// Names are compared case-insensitively; re-discovery is a no-op.
    pub(crate) fn add_script(&self, script: Script) {
        {
            let mut state = self.state();
            let key = script.name.to_lowercase();
            if state.scripts.contains_key(&key) {
                return;
            }
            state.scripts.insert(key, script.clone());
        }
        self.events.emit(DebugEvent::ModuleLoaded { script });
    }

    /// Suspend the debuggee and surface the stop
    pub async fn break_all(&self) -> Result<()> {
        self.router.request("suspend", None).await?;
        let running = self.perform_backtrace().await?;
        debug_assert!(!running, "engine kept running after suspend");
        self.events.emit(DebugEvent::AsyncBreakComplete);
        Ok(())
    }

    /// Tear the session down; idempotent
    ///
    /// Exactly one `ProcessExited` is fired per session, with the debuggee's
    /// exit code when it is known and -1 otherwise.
    pub async fn terminate(&self) {
        let _guard = self.teardown.lock().await;
        if self.state().terminated {
            return;
        }

        self.shutdown.cancel();
        self.router.fail_all();
        self.router.close().await;

        let mut exit_code: Option<i32> = None;
        let mut process = self.process.lock().await;
        match process.take() {
            Some(mut child) => match child.try_wait() {
                Ok(Some(status)) => exit_code = status.code(),
                _ => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            },
            None => {
                if self.attached && self.state().detached {
                    // Detached from a foreign process: nothing of ours exited.
                    self.state().terminated = true;
                    return;
                }
            }
        }
        drop(process);

        self.state().terminated = true;
        self.events.emit(DebugEvent::ProcessExited {
            exit_code: exit_code.unwrap_or(-1),
        });
    }

    /// Disconnect from the engine, leaving the debuggee running
    pub async fn detach(&self) -> Result<()> {
        // The engine sends no response to disconnect.
        let _ = self.router.post("disconnect", None).await;
        self.state().detached = true;
        self.shutdown.cancel();
        self.router.fail_all();
        self.router.close().await;
        Ok(())
    }
}
