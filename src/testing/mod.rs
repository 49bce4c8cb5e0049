//! A tiny scriptable engine used for unit/integration testing
//!
//! Speaks just enough of the wire protocol to exercise the client without a
//! real interpreter: canned scripts/backtrace/lookup replies, configurable
//! breakpoint placement, test-driven event injection and request recording.
//! Commands can be stalled to exercise timeout and teardown paths.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::wire::codec;

/// One canned stack frame (zero-based line, wire convention)
#[derive(Debug, Clone)]
pub struct MockFrame {
    pub script_id: i64,
    pub function: String,
    pub line: u32,
    pub arguments: Value,
    pub locals: Value,
}

impl MockFrame {
    pub fn new(script_id: i64, function: &str, line: u32) -> Self {
        Self {
            script_id,
            function: function.to_string(),
            line,
            arguments: json!([]),
            locals: json!([]),
        }
    }

    pub fn with_locals(mut self, locals: Value) -> Self {
        self.locals = locals;
        self
    }
}

/// Initial state of the mock engine
#[derive(Debug, Clone, Default)]
pub struct MockEngineConfig {
    /// Inventory returned by `scripts`
    pub scripts: Vec<(i64, String)>,
    /// Frames returned by `backtrace`
    pub frames: Vec<MockFrame>,
    /// Requested zero-based line -> where the engine "actually" places it
    pub breakpoint_line_overrides: HashMap<u32, u32>,
    /// Handle -> record returned by `lookup`
    pub lookups: HashMap<i64, Value>,
    /// Expression -> body returned by `evaluate`
    pub evaluations: HashMap<String, Value>,
}

struct MockState {
    scripts: Vec<(i64, String)>,
    frames: Vec<MockFrame>,
    breakpoint_line_overrides: HashMap<u32, u32>,
    lookups: HashMap<i64, Value>,
    evaluations: HashMap<String, Value>,
    hit_counts: HashMap<i64, u32>,
    requests: Vec<Value>,
    stalled: HashSet<String>,
    next_breakpoint_id: i64,
    running: bool,
    seq: i64,
}

impl MockState {
    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

/// Handle to a running mock engine
pub struct MockEngine {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl MockEngine {
    /// Bind an ephemeral port and serve one debugger connection
    pub async fn spawn(config: MockEngineConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock engine");
        let addr = listener.local_addr().expect("mock engine addr");

        let state = Arc::new(Mutex::new(MockState {
            scripts: config.scripts,
            frames: config.frames,
            breakpoint_line_overrides: config.breakpoint_line_overrides,
            lookups: config.lookups,
            evaluations: config.evaluations,
            hit_counts: HashMap::new(),
            requests: Vec::new(),
            stalled: HashSet::new(),
            next_breakpoint_id: 100,
            // Launched with --debug-brk: halted on the first line.
            running: false,
            seq: 1,
        }));

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, state.clone(), outbound_rx, shutdown.clone()));

        Self {
            addr,
            state,
            outbound,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the canned backtrace
    pub fn set_frames(&self, frames: Vec<MockFrame>) {
        self.state().frames = frames;
    }

    /// Set the `hit_count` that `listbreakpoints` reports for a breakpoint
    pub fn set_hit_count(&self, engine_id: i64, count: u32) {
        self.state().hit_counts.insert(engine_id, count);
    }

    pub fn add_lookup(&self, handle: i64, record: Value) {
        self.state().lookups.insert(handle, record);
    }

    /// Never answer the given command (the request is still recorded)
    pub fn stall(&self, command: &str) {
        self.state().stalled.insert(command.to_string());
    }

    /// Emit a `break` event; `None` omits the breakpoints field entirely
    pub fn emit_break(&self, breakpoint_ids: Option<Vec<i64>>) {
        let mut state = self.state();
        state.running = false;
        let seq = state.next_seq();
        let mut body = json!({ "sourceLine": 0 });
        if let Some(ids) = breakpoint_ids {
            body["breakpoints"] = json!(ids);
        }
        let event = json!({ "seq": seq, "type": "event", "event": "break", "body": body });
        let _ = self.outbound.send(event.to_string());
    }

    /// Emit an `exception` event with the given body and refs
    pub fn emit_exception(&self, body: Value, refs: Value) {
        let mut state = self.state();
        state.running = false;
        let seq = state.next_seq();
        let event = json!({
            "seq": seq,
            "type": "event",
            "event": "exception",
            "body": body,
            "refs": refs,
        });
        let _ = self.outbound.send(event.to_string());
    }

    /// Emit an `afterCompile` event for a newly seen script
    pub fn emit_after_compile(&self, script_id: i64, name: &str) {
        let seq = self.state().next_seq();
        let event = json!({
            "seq": seq,
            "type": "event",
            "event": "afterCompile",
            "body": { "script": { "id": script_id, "name": name } },
        });
        let _ = self.outbound.send(event.to_string());
    }

    /// All recorded requests for a command
    pub fn requests(&self, command: &str) -> Vec<Value> {
        self.state()
            .requests
            .iter()
            .filter(|r| r.get("command").and_then(Value::as_str) == Some(command))
            .cloned()
            .collect()
    }

    pub fn request_count(&self, command: &str) -> usize {
        self.requests(command).len()
    }

    /// Wait until at least `min_count` requests for a command arrived
    pub async fn wait_for_request(&self, command: &str, min_count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.request_count(command) >= min_count {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {min_count} '{command}' request(s); got {}",
                    self.request_count(command)
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drop the connection, as a dying debuggee would
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<Mutex<MockState>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    let stream = tokio::select! {
        _ = shutdown.cancelled() => return,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(_) => return,
        },
    };
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // The engine opens with a header-only handshake packet.
    let handshake = "Type: connect\r\nV8-Version: 3.14.5\r\nProtocol-Version: 1\r\n\
                     Embedding-Host: node v0.10.0\r\nContent-Length: 0\r\n\r\n";
    {
        use tokio::io::AsyncWriteExt;
        if writer.write_all(handshake.as_bytes()).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = codec::read_packet(&mut reader) => {
                let Ok(packet) = packet else { break };
                if packet.body.trim().is_empty() {
                    continue;
                }
                let Ok(request) = serde_json::from_str::<Value>(&packet.body) else {
                    continue;
                };
                let reply = {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    respond(&mut state, &request)
                };
                if let Some(reply) = reply {
                    if codec::write_packet(&mut writer, &reply.to_string()).await.is_err() {
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(json) = outbound else { break };
                if codec::write_packet(&mut writer, &json).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn respond(state: &mut MockState, request: &Value) -> Option<Value> {
    state.requests.push(request.clone());

    let command = request.get("command")?.as_str()?.to_string();
    let request_seq = request.get("seq")?.as_i64()?;
    let args = request.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if state.stalled.contains(&command) {
        return None;
    }

    let mut refs: Option<Value> = None;
    let (success, body) = match command.as_str() {
        "scripts" => {
            let include_source = args
                .get("includeSource")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let ids: Option<Vec<i64>> = args
                .get("ids")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_i64).collect());
            let list: Vec<Value> = state
                .scripts
                .iter()
                .filter(|(id, _)| ids.as_ref().map_or(true, |ids| ids.contains(id)))
                .map(|(id, name)| {
                    let mut script = json!({ "id": id, "name": name });
                    if include_source {
                        script["source"] = json!(format!("// source of {name}"));
                    }
                    script
                })
                .collect();
            (true, json!(list))
        }
        "backtrace" => {
            let frames: Vec<Value> = state
                .frames
                .iter()
                .enumerate()
                .map(|(index, frame)| {
                    json!({
                        "index": index,
                        "func": { "name": frame.function, "scriptId": frame.script_id },
                        "line": frame.line,
                        "arguments": frame.arguments,
                        "locals": frame.locals,
                    })
                })
                .collect();
            (
                true,
                json!({
                    "fromFrame": 0,
                    "toFrame": frames.len(),
                    "totalFrames": frames.len(),
                    "frames": frames,
                }),
            )
        }
        "setbreakpoint" => {
            let line = args.get("line").and_then(Value::as_u64).unwrap_or(0) as u32;
            let actual = state
                .breakpoint_line_overrides
                .get(&line)
                .copied()
                .unwrap_or(line);
            let id = state.next_breakpoint_id;
            state.next_breakpoint_id += 1;
            let script_id = if args.get("type").and_then(Value::as_str) == Some("scriptId") {
                args.get("target").and_then(Value::as_i64)
            } else {
                None
            };
            let mut body = json!({
                "breakpoint": id,
                "actual_locations": [{
                    "index": 0,
                    "line": actual,
                    "column": args.get("column").cloned().unwrap_or(json!(0)),
                    "script_id": script_id,
                }],
            });
            if let Some(script_id) = script_id {
                body["script_id"] = json!(script_id);
            }
            (true, body)
        }
        "clearbreakpoint" | "changebreakpoint" => (true, json!(null)),
        "listbreakpoints" => {
            let breakpoints: Vec<Value> = state
                .hit_counts
                .iter()
                .map(|(number, hit_count)| json!({ "number": number, "hit_count": hit_count }))
                .collect();
            (true, json!({ "breakpoints": breakpoints }))
        }
        "lookup" => {
            let handles: Vec<i64> = args
                .get("handles")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            let mut body = json!({});
            for handle in handles {
                if let Some(record) = state.lookups.get(&handle) {
                    body[handle.to_string()] = record.clone();
                }
            }
            refs = Some(json!([]));
            (true, body)
        }
        "evaluate" => {
            let expression = args
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or("");
            let body = state
                .evaluations
                .get(expression)
                .cloned()
                .unwrap_or_else(|| {
                    if expression.starts_with("Boolean(") {
                        json!({ "type": "boolean", "value": true })
                    } else {
                        json!({ "type": "undefined" })
                    }
                });
            (true, body)
        }
        "continue" => {
            state.running = true;
            (true, json!(null))
        }
        "suspend" => {
            state.running = false;
            (true, json!(null))
        }
        "setexceptionbreak" => (true, args.clone()),
        "disconnect" => (true, json!(null)),
        other => (false, json!({ "message": format!("unknown command: {other}") })),
    };

    let seq = state.next_seq();
    let mut response = json!({
        "seq": seq,
        "type": "response",
        "request_seq": request_seq,
        "command": command,
        "success": success,
        "running": state.running,
        "body": body,
    });
    if !success {
        let message = response
            .pointer("/body/message")
            .cloned()
            .unwrap_or_else(|| json!("request failed"));
        response["message"] = message;
    }
    if let Some(refs) = refs {
        response["refs"] = refs;
    }
    Some(response)
}
