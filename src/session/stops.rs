//! Break orchestration
//!
//! An engine stop can mean several things at once: a breakpoint hit, a step
//! completing, the entry-point halt, an async-break, or nothing the user
//! asked for. This module reconciles them and either surfaces one client
//! event or resumes silently.

use serde_json::{json, Value};

use super::{Session, SteppingState};
use crate::breakpoints::BreakOnKind;
use crate::events::DebugEvent;
use crate::session::Script;

/// Stepping mode, as the user requested it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    fn engine_action(&self) -> &'static str {
        match self {
            StepKind::Over => "next",
            StepKind::Into => "in",
            StepKind::Out => "out",
        }
    }
}

/// What to do with a stop no binding claimed
#[derive(Debug, Clone, Copy)]
pub(crate) enum NoHitAction {
    Resume,
    EntryPoint,
}

impl Session {
    pub(crate) async fn handle_event(&self, json: &Value) {
        match json.get("event").and_then(Value::as_str).unwrap_or("") {
            "break" => self.on_break(json).await,
            "exception" => self.on_exception(json).await,
            "afterCompile" => self.on_after_compile(json),
            other => tracing::debug!(event = other, "ignoring unknown engine event"),
        }
    }

    fn on_after_compile(&self, json: &Value) {
        let Some(id) = json.pointer("/body/script/id").and_then(Value::as_i64) else {
            return;
        };
        let Some(name) = json.pointer("/body/script/name").and_then(Value::as_str) else {
            return;
        };
        self.add_script(Script {
            id,
            name: name.to_string(),
        });
    }

    /// Inbound `break` event
    async fn on_break(&self, json: &Value) {
        // Engine ids we don't have a binding for are silently dropped; no
        // `breakpoints` field at all means a step completed.
        let bindings = json
            .pointer("/body/breakpoints")
            .and_then(Value::as_array)
            .map(|ids| {
                let state = self.state();
                ids.iter()
                    .filter_map(Value::as_i64)
                    .filter(|id| state.bindings.contains_key(id))
                    .collect::<Vec<_>>()
            });

        match self.perform_backtrace().await {
            Ok(running) => debug_assert!(!running, "engine kept running after a break"),
            Err(err) => {
                tracing::warn!(%err, "backtrace after break failed");
                return;
            }
        }

        self.process_break(bindings, NoHitAction::Resume, true).await;
    }

    /// Decide what a stop means
    ///
    /// `bindings` of `None` is the step-completion path; an empty list means
    /// no binding claimed the stop. Partially bound bindings are re-bound
    /// here, now that the target code is live; the stop only counts as a hit
    /// when the re-bind lands on the line we are stopped at (a re-bind landing
    /// elsewhere means the engine compiled the real target late - the
    /// lambda/eval fix-up case).
    pub(crate) async fn process_break(
        &self,
        bindings: Option<Vec<i64>>,
        no_hit: NoHitAction,
        test_fully_bound: bool,
    ) {
        let Some(engine_ids) = bindings else {
            self.complete_stepping().await;
            return;
        };

        let mut hit = Vec::new();
        for engine_id in engine_ids {
            let Some(binding) = self.state().bindings.get(&engine_id).cloned() else {
                continue;
            };

            if binding.fully_bound {
                if !test_fully_bound || self.test_and_process_hit_counts(&binding).await {
                    hit.push(binding);
                }
                continue;
            }

            // Partially bound: drop the snapped placement and bind again.
            if let Err(err) = self.remove_breakpoint(binding.engine_id).await {
                tracing::warn!(%err, "could not clear partially bound breakpoint");
                continue;
            }
            let breakpoint = binding.breakpoint.clone();
            match self.set_engine_breakpoint(&breakpoint, false).await {
                Ok(placed) => {
                    let fully = placed.script_id.is_some() && placed.line == breakpoint.line;
                    let replacement = self.register_binding(placed, breakpoint, fully);
                    self.events.emit(DebugEvent::BreakpointBound {
                        engine_id: replacement.engine_id,
                        path: replacement.breakpoint.path.clone(),
                        line: replacement.line,
                    });
                    let top_line = self.state().frames.first().map(|f| f.line);
                    if top_line == Some(replacement.line)
                        && self.test_and_process_hit_counts(&replacement).await
                    {
                        hit.push(replacement);
                    }
                }
                Err(err) => tracing::warn!(%err, "re-bind failed"),
            }
        }

        if hit.is_empty() {
            match no_hit {
                NoHitAction::Resume => self.auto_resume(false).await,
                NoHitAction::EntryPoint => self.emit_entry_point_hit(),
            }
            return;
        }

        for binding in hit {
            self.process_breakpoint_hit(&binding).await;
            self.events.emit(DebugEvent::BreakpointHit {
                engine_id: binding.engine_id,
                path: binding.breakpoint.path.clone(),
                line: binding.line,
            });
        }
    }

    /// Condition predicate plus hit-count policy; true when the stop counts
    async fn test_and_process_hit_counts(&self, binding: &crate::breakpoints::Binding) -> bool {
        if let Some(condition) = &binding.breakpoint.condition {
            if !self.test_predicate(condition).await {
                return false;
            }
        }
        if binding.breakpoint.break_on.kind() == BreakOnKind::Always {
            return true;
        }
        match self.breakpoint_hit_count(binding.engine_id).await {
            Ok(Some(count)) => binding.breakpoint.break_on.is_hit(count),
            Ok(None) => false,
            Err(err) => {
                tracing::debug!(%err, "hit-count query failed; treating as not hit");
                false
            }
        }
    }

    /// Side effects of a counted hit, before the embedder hears about it
    async fn process_breakpoint_hit(&self, binding: &crate::breakpoints::Binding) {
        if binding.breakpoint.break_on.kind() == BreakOnKind::Always {
            return;
        }
        // Re-align the engine ignore count with the policy for the next stop.
        if let Ok(Some(count)) = self.breakpoint_hit_count(binding.engine_id).await {
            let break_on = binding.breakpoint.break_on;
            let ignore = break_on.engine_ignore_count(count);
            let enabled = break_on.engine_enabled(binding.breakpoint.enabled, count);
            let _ = self
                .update_breakpoint(binding.engine_id, Some(enabled), None, Some(ignore), false)
                .await;
        }
    }

    /// A stop with no bindings attached: is the user's step done?
    ///
    /// While resuming after a swallowed stop, a deeper current frame means a
    /// breakpoint fired inside a call the user meant to step across; unwind
    /// with `out` and keep the stepping state so the next stop re-enters this
    /// check. Otherwise the step is complete.
    pub(crate) async fn complete_stepping(&self) {
        let (stepping, frame_count) = {
            let state = self.state();
            (state.stepping, state.frames.len())
        };

        if stepping.resuming {
            let deeper = match stepping.mode {
                Some(StepKind::Over) => frame_count > stepping.frame_depth,
                Some(StepKind::Out) => frame_count + 1 > stepping.frame_depth,
                _ => false,
            };
            if deeper {
                self.continue_run(Some(StepKind::Out), false).await;
                return;
            }
        }

        self.state().stepping = SteppingState::default();
        self.events.emit(DebugEvent::StepComplete);
    }

    /// Resume after a stop the user never sees
    pub(crate) async fn auto_resume(&self, need_backtrace: bool) {
        let stepping_active = self.state().stepping.mode.is_some();
        if stepping_active {
            if need_backtrace {
                if let Err(err) = self.perform_backtrace().await {
                    tracing::warn!(%err, "backtrace before resume failed");
                }
            }
            self.state().stepping.resuming = true;
            self.complete_stepping().await;
        } else {
            self.continue_run(None, false).await;
        }
    }

    /// Send `continue`, optionally as a step
    ///
    /// `reset` starts a fresh step at the current frame depth; without it the
    /// stepping state is left untouched (the unwind path relies on that).
    pub(crate) async fn continue_run(&self, mode: Option<StepKind>, reset: bool) {
        {
            let mut state = self.state();
            if reset {
                state.stepping = SteppingState {
                    mode,
                    frame_depth: state.frames.len(),
                    resuming: false,
                };
            }
            state.load_complete_handled = true;
            state.handle_entry_point_hit = false;
            state.running = true;
        }
        let args = mode.map(|m| json!({ "stepaction": m.engine_action() }));
        if let Err(err) = self.router.post("continue", args).await {
            tracing::warn!(%err, "continue failed");
        }
    }

    fn emit_entry_point_hit(&self) {
        let armed = {
            let mut state = self.state();
            let armed = state.handle_entry_point_hit;
            state.handle_entry_point_hit = false;
            armed
        };
        if armed {
            self.events.emit(DebugEvent::EntryPointHit);
        }
    }

    /// Resume the debuggee
    ///
    /// The first resume after load stops at the entry point instead of
    /// running: it honors any binding already sitting on the first line, and
    /// emits `EntryPointHit` when none of them claims the stop. A later
    /// resume with the entry-point flag still armed (a when-hit breakpoint on
    /// the first line was just processed) surfaces the entry point before any
    /// real continue goes out.
    pub async fn resume(&self) {
        enum Route {
            FirstLoad,
            EntryArmed,
            Auto,
        }

        let route = {
            let mut state = self.state();
            if !state.load_complete_handled {
                state.load_complete_handled = true;
                state.handle_entry_point_hit = true;
                Route::FirstLoad
            } else if state.handle_entry_point_hit {
                Route::EntryArmed
            } else {
                Route::Auto
            }
        };

        match route {
            Route::FirstLoad => {
                let matching = {
                    let state = self.state();
                    match state.frames.first() {
                        Some(top) => state
                            .bindings
                            .values()
                            .filter(|b| {
                                b.breakpoint.enabled
                                    && b.line == top.line
                                    && b.breakpoint.path.eq_ignore_ascii_case(&top.script.name)
                            })
                            .map(|b| b.engine_id)
                            .collect::<Vec<_>>(),
                        None => Vec::new(),
                    }
                };
                if matching.is_empty() {
                    self.emit_entry_point_hit();
                } else {
                    self.process_break(Some(matching), NoHitAction::EntryPoint, true)
                        .await;
                }
            }
            Route::EntryArmed => self.emit_entry_point_hit(),
            Route::Auto => self.auto_resume(false).await,
        }
    }

    /// Step over the current line
    pub async fn step_over(&self) {
        self.continue_run(Some(StepKind::Over), true).await;
    }

    /// Step into the call on the current line
    pub async fn step_into(&self) {
        self.continue_run(Some(StepKind::Into), true).await;
    }

    /// Step out of the current frame
    pub async fn step_out(&self) {
        self.continue_run(Some(StepKind::Out), true).await;
    }
}
