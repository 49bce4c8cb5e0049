//! Breakpoint binding and lifecycle
//!
//! A user [`Breakpoint`] becomes an engine-side [`Binding`] through
//! `setbreakpoint`. The engine may snap the location to a different line
//! (a partial bind), in which case the binding is kept for a later re-bind
//! and the caller is told the bind failed so the front-end can flag it.

use serde_json::{json, Value};

use crate::common::{Error, Result};
use crate::events::DebugEvent;
use crate::session::Session;
use crate::wire::types::BreakpointSetBody;

/// Hit-count policy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOnKind {
    /// Break on every hit
    Always,
    /// Break when the hit count equals the target
    Equal,
    /// Break once the hit count reaches the target
    GreaterThanOrEqual,
    /// Break every N hits
    Mod,
}

/// Hit-count policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakOn {
    kind: BreakOnKind,
    count: u32,
}

impl BreakOn {
    pub fn always() -> Self {
        Self {
            kind: BreakOnKind::Always,
            count: 0,
        }
    }

    /// Build a policy; counted kinds require `count >= 1`
    pub fn new(kind: BreakOnKind, count: u32) -> Result<Self> {
        if kind != BreakOnKind::Always && count < 1 {
            return Err(Error::InvalidBreakOn);
        }
        Ok(Self { kind, count })
    }

    pub fn kind(&self) -> BreakOnKind {
        self.kind
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether a stop at the given engine hit count should surface
    pub(crate) fn is_hit(&self, hit_count: u32) -> bool {
        match self.kind {
            BreakOnKind::Always => true,
            BreakOnKind::Equal => hit_count == self.count,
            BreakOnKind::GreaterThanOrEqual => hit_count >= self.count,
            BreakOnKind::Mod => hit_count % self.count == 0,
        }
    }

    /// Engine-side enabled flag under this policy
    ///
    /// An Equal policy that has already fired keeps the engine breakpoint off.
    pub(crate) fn engine_enabled(&self, enabled: bool, hit_count: u32) -> bool {
        if enabled && self.kind == BreakOnKind::Equal && hit_count >= self.count {
            return false;
        }
        enabled
    }

    /// Engine `ignoreCount` so the next stop lands on the policy boundary
    pub(crate) fn engine_ignore_count(&self, hit_count: u32) -> u32 {
        match self.kind {
            BreakOnKind::Always => 0,
            BreakOnKind::Equal | BreakOnKind::GreaterThanOrEqual => {
                self.count.saturating_sub(1).saturating_sub(hit_count)
            }
            BreakOnKind::Mod => self.count - hit_count % self.count - 1,
        }
    }
}

impl Default for BreakOn {
    fn default() -> Self {
        Self::always()
    }
}

/// User breakpoint request
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub path: String,
    /// 1-based line
    pub line: u32,
    pub enabled: bool,
    pub break_on: BreakOn,
    pub condition: Option<String>,
}

impl Breakpoint {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
            enabled: true,
            break_on: BreakOn::always(),
            condition: None,
        }
    }

    pub fn with_break_on(mut self, break_on: BreakOn) -> Self {
        self.break_on = break_on;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Engine-side realization of a [`Breakpoint`]
///
/// `fully_bound` is decided once at bind time; a successful re-bind produces
/// a new `Binding` rather than mutating the old one.
#[derive(Debug, Clone)]
pub struct Binding {
    pub engine_id: i64,
    pub script_id: Option<i64>,
    /// 1-based line the engine actually bound
    pub line: u32,
    pub fully_bound: bool,
    pub unbound: bool,
    pub breakpoint: Breakpoint,
}

/// What the engine reported back from `setbreakpoint`
#[derive(Debug, Clone)]
pub(crate) struct PlacedBreakpoint {
    pub engine_id: i64,
    pub script_id: Option<i64>,
    /// 1-based
    pub line: u32,
}

/// Build a case-insensitive path regex in the engine's dialect
///
/// The dialect has no case-insensitivity flag, so every alphabetic character
/// becomes a two-member class. Full paths are anchored `^...$`; when attached
/// to an already-running process the working directory is unknown, so only
/// the leaf name is matched with a separator prefix.
pub(crate) fn case_insensitive_path_regex(path: &str, leaf_only: bool) -> String {
    let subject = if leaf_only {
        path.rsplit(['/', '\\']).next().unwrap_or(path)
    } else {
        path
    };

    let mut regex = String::with_capacity(subject.len() * 4 + 8);
    if leaf_only {
        regex.push_str(r"[\\/]");
    } else {
        regex.push('^');
    }
    for c in subject.chars() {
        if c.is_ascii_alphabetic() {
            regex.push('[');
            regex.push(c.to_ascii_uppercase());
            regex.push(c.to_ascii_lowercase());
            regex.push(']');
        } else if r"\^$.|?*+()[]{}".contains(c) {
            regex.push('\\');
            regex.push(c);
        } else {
            regex.push(c);
        }
    }
    regex.push('$');
    regex
}

impl Session {
    /// Bind a user breakpoint in the engine
    ///
    /// Returns the binding when the engine placed it at the requested line.
    /// A partial bind keeps the binding in the session (for a later re-bind)
    /// but reports failure, so the front-end can mark the breakpoint with a
    /// warning glyph.
    pub async fn add_breakpoint(&self, breakpoint: Breakpoint) -> Result<Binding> {
        let placed = self.set_engine_breakpoint(&breakpoint, false).await?;
        let fully_bound = placed.script_id.is_some() && placed.line == breakpoint.line;

        if fully_bound {
            let binding = self.register_binding(placed, breakpoint, true);
            self.events.emit(DebugEvent::BreakpointBound {
                engine_id: binding.engine_id,
                path: binding.breakpoint.path.clone(),
                line: binding.line,
            });
            return Ok(binding);
        }

        if breakpoint.condition.is_some() {
            // The engine moved the breakpoint and cannot be trusted to honor
            // the predicate at the new location: re-set without it.
            let _ = self
                .router
                .request("clearbreakpoint", Some(json!({ "breakpoint": placed.engine_id })))
                .await;
            match self.set_engine_breakpoint(&breakpoint, true).await {
                Ok(replacement) => {
                    let bound_line = replacement.line;
                    self.register_binding(replacement, breakpoint.clone(), false);
                    self.events.emit(DebugEvent::BreakpointBindFailure {
                        path: breakpoint.path.clone(),
                        line: breakpoint.line,
                        bound_line: Some(bound_line),
                    });
                }
                Err(err) => {
                    tracing::warn!(%err, "re-bind without predicate failed");
                    self.events.emit(DebugEvent::BreakpointBindFailure {
                        path: breakpoint.path.clone(),
                        line: breakpoint.line,
                        bound_line: None,
                    });
                }
            }
            return Err(Error::BindFailed {
                path: breakpoint.path,
                line: breakpoint.line,
            });
        }

        let bound_line = placed.line;
        self.register_binding(placed, breakpoint.clone(), false);
        self.events.emit(DebugEvent::BreakpointBindFailure {
            path: breakpoint.path.clone(),
            line: breakpoint.line,
            bound_line: Some(bound_line),
        });
        Err(Error::BindFailed {
            path: breakpoint.path,
            line: breakpoint.line,
        })
    }

    /// Place a breakpoint in the engine, without local bookkeeping
    pub(crate) async fn set_engine_breakpoint(
        &self,
        breakpoint: &Breakpoint,
        without_predicate: bool,
    ) -> Result<PlacedBreakpoint> {
        let engine_line = breakpoint.line.saturating_sub(1);
        // Column 1 skips the `(function (exports, ...)` wrapper the engine
        // puts around require-loaded scripts on their first line.
        let column = if engine_line == 0 { 1 } else { 0 };

        let (target_type, target) = {
            let state = self.state();
            match state.script_by_path(&breakpoint.path) {
                Some(script) => ("scriptId", json!(script.id)),
                None => (
                    "scriptRegExp",
                    json!(case_insensitive_path_regex(&breakpoint.path, self.attached)),
                ),
            }
        };

        let mut args = json!({
            "line": engine_line,
            "column": column,
            "type": target_type,
            "target": target,
        });
        // A fresh engine breakpoint has no hits yet.
        let hit_count = 0;
        if !breakpoint.break_on.engine_enabled(breakpoint.enabled, hit_count) {
            args["enabled"] = json!(false);
        }
        if !without_predicate {
            args["ignoreCount"] = json!(breakpoint.break_on.engine_ignore_count(hit_count));
            if let Some(condition) = &breakpoint.condition {
                args["condition"] = json!(condition);
            }
        }

        let response = self.router.request("setbreakpoint", Some(args)).await?;
        let body: BreakpointSetBody =
            serde_json::from_value(response.body.unwrap_or(Value::Null))
                .map_err(|e| Error::Protocol(format!("malformed setbreakpoint response: {e}")))?;

        let (line, location_script) = match body.actual_locations.first() {
            Some(location) => (location.line + 1, location.script_id),
            None => (breakpoint.line, None),
        };

        Ok(PlacedBreakpoint {
            engine_id: body.breakpoint,
            script_id: body.script_id.or(location_script),
            line,
        })
    }

    pub(crate) fn register_binding(
        &self,
        placed: PlacedBreakpoint,
        breakpoint: Breakpoint,
        fully_bound: bool,
    ) -> Binding {
        let binding = Binding {
            engine_id: placed.engine_id,
            script_id: placed.script_id,
            line: placed.line,
            fully_bound,
            unbound: false,
            breakpoint,
        };
        self.state()
            .bindings
            .insert(binding.engine_id, binding.clone());
        binding
    }

    /// Change an existing engine breakpoint
    ///
    /// With `validate` the call waits for the engine to confirm (bounded, with
    /// the has-exited short-circuit); otherwise it returns immediately.
    pub async fn update_breakpoint(
        &self,
        engine_id: i64,
        enabled: Option<bool>,
        condition: Option<&str>,
        ignore_count: Option<u32>,
        validate: bool,
    ) -> Result<()> {
        let mut args = json!({ "breakpoint": engine_id });
        if let Some(enabled) = enabled {
            args["enabled"] = json!(enabled);
        }
        if let Some(condition) = condition {
            args["condition"] = json!(condition);
        }
        if let Some(ignore_count) = ignore_count {
            args["ignoreCount"] = json!(ignore_count);
        }

        if validate {
            self.router
                .request_with("changebreakpoint", Some(args), self.sync_timeout(), || {
                    self.has_exited()
                })
                .await?;
            Ok(())
        } else {
            self.router.post("changebreakpoint", Some(args)).await
        }
    }

    /// Query the engine's hit count for a breakpoint
    ///
    /// Returns `None` when the engine no longer lists the breakpoint.
    pub async fn breakpoint_hit_count(&self, engine_id: i64) -> Result<Option<u32>> {
        let response = self
            .router
            .request_with("listbreakpoints", None, self.sync_timeout(), || {
                self.has_exited()
            })
            .await?;

        let count = response
            .body
            .as_ref()
            .and_then(|body| body.get("breakpoints"))
            .and_then(Value::as_array)
            .and_then(|list| {
                list.iter()
                    .find(|entry| entry.get("number").and_then(Value::as_i64) == Some(engine_id))
            })
            .and_then(|entry| entry.get("hit_count"))
            .and_then(Value::as_u64)
            .map(|count| count as u32);
        Ok(count)
    }

    /// Remove a binding; idempotent
    pub async fn remove_breakpoint(&self, engine_id: i64) -> Result<()> {
        if !self.state().bindings.contains_key(&engine_id) {
            // Already unbound.
            return Ok(());
        }

        self.router
            .request("clearbreakpoint", Some(json!({ "breakpoint": engine_id })))
            .await?;

        let removed = self.state().bindings.remove(&engine_id);
        if let Some(mut binding) = removed {
            binding.unbound = true;
            self.events
                .emit(DebugEvent::BreakpointUnbound { engine_id });
        }
        Ok(())
    }

    /// Snapshot of the live bindings
    pub fn bindings(&self) -> Vec<Binding> {
        self.state().bindings.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_policies_reject_zero() {
        assert!(BreakOn::new(BreakOnKind::Equal, 0).is_err());
        assert!(BreakOn::new(BreakOnKind::GreaterThanOrEqual, 0).is_err());
        assert!(BreakOn::new(BreakOnKind::Mod, 0).is_err());
        assert!(BreakOn::new(BreakOnKind::Always, 0).is_ok());
        assert!(BreakOn::new(BreakOnKind::Equal, 1).is_ok());
    }

    #[test]
    fn hit_decisions_follow_the_policy() {
        let gte = BreakOn::new(BreakOnKind::GreaterThanOrEqual, 2).unwrap();
        assert!(!gte.is_hit(1));
        assert!(gte.is_hit(2));
        assert!(gte.is_hit(5));

        let eq = BreakOn::new(BreakOnKind::Equal, 3).unwrap();
        assert!(!eq.is_hit(2));
        assert!(eq.is_hit(3));
        assert!(!eq.is_hit(4));

        let every = BreakOn::new(BreakOnKind::Mod, 4).unwrap();
        assert!(!every.is_hit(3));
        assert!(every.is_hit(4));
        assert!(every.is_hit(8));
    }

    #[test]
    fn engine_ignore_counts() {
        assert_eq!(BreakOn::always().engine_ignore_count(7), 0);
        let gte = BreakOn::new(BreakOnKind::GreaterThanOrEqual, 5).unwrap();
        assert_eq!(gte.engine_ignore_count(0), 4);
        assert_eq!(gte.engine_ignore_count(3), 1);
        assert_eq!(gte.engine_ignore_count(10), 0);
        let every = BreakOn::new(BreakOnKind::Mod, 3).unwrap();
        assert_eq!(every.engine_ignore_count(0), 2);
        assert_eq!(every.engine_ignore_count(4), 1);
    }

    #[test]
    fn satisfied_equal_policy_disables_the_engine_breakpoint() {
        let eq = BreakOn::new(BreakOnKind::Equal, 2).unwrap();
        assert!(eq.engine_enabled(true, 1));
        assert!(!eq.engine_enabled(true, 2));
        assert!(!eq.engine_enabled(false, 0));
        assert!(BreakOn::always().engine_enabled(true, 100));
    }

    #[test]
    fn path_regex_is_case_insensitive_and_escaped() {
        assert_eq!(case_insensitive_path_regex("a.js", false), r"^[Aa]\.[Jj][Ss]$");
        assert_eq!(
            case_insensitive_path_regex("/srv/app/a.js", true),
            r"[\\/][Aa]\.[Jj][Ss]$"
        );
        // Separators and digits pass through; regex metacharacters are escaped.
        assert_eq!(
            case_insensitive_path_regex("/x1/(v)/m.js", false),
            r"^/[Xx]1/\([Vv]\)/[Mm]\.[Jj][Ss]$"
        );
    }
}
