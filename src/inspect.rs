//! Backtrace and value inspection
//!
//! The `backtrace` response (with `inlineRefs`) carries most values inline,
//! but the engine sometimes returns numbers by reference only; those are
//! patched up with a single batched `lookup` before the frames are installed.

use serde_json::{json, Value};

use crate::common::{Error, Result};
use crate::session::{Script, Session, StackFrame};

/// Type tag of a materialized value
///
/// `undefined` has no tag: undefined values are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Object,
    String,
    Number,
    Boolean,
    Null,
    Date,
    Function,
}

/// A materialized debuggee value
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// Engine handle, when the value is resolvable via `lookup`
    pub handle: Option<i64>,
    pub display: String,
    /// `0x%08X` form, present when the decimal parses as a 32-bit integer
    pub hex_display: Option<String>,
    pub kind: ValueKind,
    pub name: String,
    /// Expression trail used to evaluate children of this value
    pub expression: String,
    pub expandable: bool,
    /// Set when the engine rejected an evaluation; `display` holds its message
    pub is_error: bool,
}

pub(crate) fn hex_display(decimal: &str) -> Option<String> {
    decimal
        .parse::<i32>()
        .ok()
        .map(|n| format!("0x{:08X}", n as u32))
}

fn non_blank(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Materialize one value record
///
/// Returns `None` for `undefined` and for types the client does not model
/// (those are logged and dropped).
pub(crate) fn variable_result(
    name: &str,
    expression: &str,
    record: &Value,
) -> Option<EvaluationResult> {
    let value_type = record.get("type").and_then(Value::as_str).unwrap_or("");
    let handle = record
        .get("ref")
        .and_then(Value::as_i64)
        .or_else(|| record.get("handle").and_then(Value::as_i64));

    let result = |kind, display: String, hex: Option<String>, handle, expandable| EvaluationResult {
        handle,
        display,
        hex_display: hex,
        kind,
        name: name.to_string(),
        expression: expression.to_string(),
        expandable,
        is_error: false,
    };

    match value_type {
        "object" => {
            let class_name = record
                .get("className")
                .and_then(Value::as_str)
                .unwrap_or("Object");
            if class_name == "Date" {
                let display = record
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Some(result(ValueKind::Date, display, None, handle, false))
            } else {
                Some(result(
                    ValueKind::Object,
                    class_name.to_string(),
                    None,
                    handle,
                    true,
                ))
            }
        }
        "string" => {
            let text = record.get("value").and_then(Value::as_str).unwrap_or("");
            Some(result(
                ValueKind::String,
                format!("\"{text}\""),
                None,
                handle,
                false,
            ))
        }
        "number" => match record.get("value") {
            Some(Value::Number(n)) => {
                let display = n.to_string();
                let hex = hex_display(&display);
                Some(result(ValueKind::Number, display, hex, handle, false))
            }
            // NaN and the infinities come over as strings.
            Some(Value::String(s)) => {
                let hex = hex_display(s);
                Some(result(ValueKind::Number, s.clone(), hex, handle, false))
            }
            // Value omitted: a fix-up candidate, resolved by handle later.
            _ => Some(result(
                ValueKind::Number,
                "null".to_string(),
                None,
                handle,
                false,
            )),
        },
        "boolean" => {
            let b = record.get("value").and_then(Value::as_bool).unwrap_or(false);
            Some(result(ValueKind::Boolean, b.to_string(), None, handle, false))
        }
        "null" => Some(result(ValueKind::Null, "null".to_string(), None, handle, false)),
        "undefined" => None,
        "function" => {
            let fn_name = record
                .get("name")
                .and_then(Value::as_str)
                .and_then(non_blank)
                .or_else(|| {
                    record
                        .get("inferredName")
                        .and_then(Value::as_str)
                        .and_then(non_blank)
                });
            let display = match fn_name {
                Some(n) => format!("[Function: {n}]"),
                None => "[Function]".to_string(),
            };
            Some(result(ValueKind::Function, display, None, handle, true))
        }
        other => {
            tracing::warn!(value_type = other, name, "dropping value with unknown type");
            None
        }
    }
}

fn error_result(expression: &str, message: &str) -> EvaluationResult {
    EvaluationResult {
        handle: None,
        display: message.to_string(),
        hex_display: None,
        kind: ValueKind::String,
        name: expression.to_string(),
        expression: expression.to_string(),
        expandable: false,
        is_error: true,
    }
}

/// Collect `{name, value}` entries into results, dropping the unrepresentable
fn collect_variables(entries: Option<&Value>) -> Vec<EvaluationResult> {
    let Some(entries) = entries.and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            let record = entry.get("value").unwrap_or(entry);
            variable_result(name, name, record)
        })
        .collect()
}

fn function_display_name(func: Option<&Value>) -> String {
    func.and_then(|f| {
        f.get("name")
            .and_then(Value::as_str)
            .and_then(non_blank)
            .or_else(|| f.get("inferredName").and_then(Value::as_str).and_then(non_blank))
    })
    .unwrap_or("<anonymous>")
    .to_string()
}

impl Session {
    /// Fetch a fresh backtrace and install it as the thread's frame vector
    ///
    /// Returns `true` when the engine reports the debuggee running again (the
    /// stop evaporated under the client); nothing is mutated in that case.
    pub(crate) async fn perform_backtrace(&self) -> Result<bool> {
        let response = self
            .router
            .request("backtrace", Some(json!({ "inlineRefs": true })))
            .await?;
        let running = response.running;
        self.state().running = running;
        if running {
            return Ok(true);
        }

        let body = response.body.unwrap_or(Value::Null);
        let empty = Vec::new();
        let raw_frames = body
            .get("frames")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let mut frames = Vec::with_capacity(raw_frames.len());
        {
            let state = self.state();
            for (position, frame) in raw_frames.iter().enumerate() {
                let script = frame
                    .pointer("/func/scriptId")
                    .and_then(Value::as_i64)
                    .and_then(|id| state.script_by_id(id))
                    .unwrap_or_else(Script::unknown);
                let line = frame.get("line").and_then(Value::as_u64).unwrap_or(0) as u32 + 1;
                let index = frame
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64) as u32;
                frames.push(StackFrame {
                    index,
                    script,
                    function: function_display_name(frame.get("func")),
                    line,
                    parameters: collect_variables(frame.get("arguments")),
                    locals: collect_variables(frame.get("locals")),
                });
            }
        }

        self.fixup_backtrace(&mut frames).await;
        self.state().frames = frames;
        Ok(false)
    }

    /// Resolve numbers the engine returned by reference only
    ///
    /// One batched `lookup` covers every affected value; if it fails the
    /// frames are installed as-is.
    async fn fixup_backtrace(&self, frames: &mut [StackFrame]) {
        let needs_fixup = |v: &EvaluationResult| {
            v.kind == ValueKind::Number && v.display == "null" && v.handle.unwrap_or(0) > 0
        };

        let mut handles: Vec<i64> = frames
            .iter()
            .flat_map(|f| f.parameters.iter().chain(f.locals.iter()))
            .filter(|v| needs_fixup(v))
            .filter_map(|v| v.handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        handles.sort_unstable();
        handles.dedup();

        let response = match self
            .router
            .request(
                "lookup",
                Some(json!({ "handles": handles, "includeSource": false })),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(%err, "value lookup failed; installing frames as-is");
                return;
            }
        };
        let body = response.body.unwrap_or(Value::Null);

        for frame in frames.iter_mut() {
            for value in frame.parameters.iter_mut().chain(frame.locals.iter_mut()) {
                if !needs_fixup(value) {
                    continue;
                }
                let Some(handle) = value.handle else { continue };
                if let Some(text) = body
                    .get(handle.to_string())
                    .and_then(|record| record.get("text"))
                    .and_then(Value::as_str)
                {
                    value.display = text.to_string();
                    value.hex_display = hex_display(text);
                }
            }
        }
    }

    /// Enumerate the children of an expandable value
    pub async fn children(&self, parent: &EvaluationResult) -> Result<Vec<EvaluationResult>> {
        let Some(handle) = parent.handle else {
            return Ok(Vec::new());
        };
        let response = self
            .router
            .request(
                "lookup",
                Some(json!({ "handles": [handle], "includeSource": false })),
            )
            .await?;

        let body = response.body.unwrap_or(Value::Null);
        let record = body
            .get(handle.to_string())
            .cloned()
            .ok_or_else(|| Error::Protocol("lookup response missing the requested handle".into()))?;
        let empty = Vec::new();
        let refs = response
            .refs
            .as_ref()
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        let resolve = |reference: i64| {
            refs.iter()
                .find(|r| r.get("handle").and_then(Value::as_i64) == Some(reference))
        };

        let properties = record
            .get("properties")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let class_name = record.get("className").and_then(Value::as_str);
        let mut children = Vec::new();

        if matches!(class_name, Some("Array") | Some("Arguments")) {
            // The first property is the length; the indexed elements follow.
            let length = properties
                .first()
                .and_then(|p| p.get("ref"))
                .and_then(Value::as_i64)
                .and_then(resolve)
                .and_then(|r| r.get("value"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            for i in 1..=length {
                let Some(property) = properties.get(i) else {
                    break;
                };
                let name = format!("[{}]", i - 1);
                let expression = format!("{}[{}]", parent.expression, i - 1);
                if let Some(child) = property
                    .get("ref")
                    .and_then(Value::as_i64)
                    .and_then(resolve)
                    .and_then(|record| variable_result(&name, &expression, record))
                {
                    children.push(child);
                }
            }
        } else {
            for property in &properties {
                let name = match property.get("name") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => continue,
                };
                let expression = if name.chars().all(|c| c.is_ascii_digit()) {
                    format!("{}[{}]", parent.expression, name)
                } else {
                    format!("{}.{}", parent.expression, name)
                };
                if let Some(child) = property
                    .get("ref")
                    .and_then(Value::as_i64)
                    .and_then(resolve)
                    .and_then(|record| variable_result(&name, &expression, record))
                {
                    children.push(child);
                }
            }
        }

        Ok(children)
    }

    /// Evaluate an expression in a frame
    ///
    /// Engine rejections come back as an error-marked result; `None` means
    /// the expression evaluated to `undefined`.
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_index: u32,
    ) -> Result<Option<EvaluationResult>> {
        let args = json!({
            "expression": expression,
            "frame": frame_index,
            "global": false,
            "disable_break": true,
        });
        match self.router.request("evaluate", Some(args)).await {
            Ok(response) => {
                let body = response.body.unwrap_or(Value::Null);
                Ok(variable_result(expression, expression, &body))
            }
            Err(Error::CommandFailed { message, .. }) => {
                Ok(Some(error_result(expression, &message)))
            }
            Err(err) => Err(err),
        }
    }

    /// Test a breakpoint condition on the top frame
    pub(crate) async fn test_predicate(&self, expression: &str) -> bool {
        let args = json!({
            "expression": format!("Boolean({expression})"),
            "frame": 0,
            "global": false,
            "disable_break": true,
        });
        match self.router.request("evaluate", Some(args)).await {
            Ok(response) => response
                .body
                .map(|body| {
                    body.get("type").and_then(Value::as_str) == Some("boolean")
                        && body.get("value").and_then(Value::as_bool) == Some(true)
                })
                .unwrap_or(false),
            Err(err) => {
                tracing::debug!(%err, expression, "predicate test failed");
                false
            }
        }
    }

    /// Fetch the source text of a script
    pub async fn script_source(&self, script_id: i64) -> Result<Option<String>> {
        let args = json!({ "ids": [script_id], "includeSource": true });
        let response = self
            .router
            .request_with("scripts", Some(args), self.sync_timeout(), || {
                self.has_exited()
            })
            .await?;
        let source = response
            .body
            .as_ref()
            .and_then(Value::as_array)
            .and_then(|scripts| scripts.first())
            .and_then(|script| script.get("source"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_get_a_hex_form_when_they_fit_32_bits() {
        assert_eq!(hex_display("42").as_deref(), Some("0x0000002A"));
        assert_eq!(hex_display("-1").as_deref(), Some("0xFFFFFFFF"));
        assert_eq!(hex_display("0").as_deref(), Some("0x00000000"));
        assert_eq!(hex_display("5000000000"), None);
        assert_eq!(hex_display("3.14"), None);
        assert_eq!(hex_display("NaN"), None);
    }

    #[test]
    fn number_values_display_decimal_and_hex() {
        let record = serde_json::json!({ "type": "number", "value": 42, "ref": 9 });
        let result = variable_result("x", "x", &record).unwrap();
        assert_eq!(result.kind, ValueKind::Number);
        assert_eq!(result.display, "42");
        assert_eq!(result.hex_display.as_deref(), Some("0x0000002A"));
        assert_eq!(result.handle, Some(9));
        assert!(!result.expandable);
    }

    #[test]
    fn omitted_number_value_is_a_fixup_placeholder() {
        let record = serde_json::json!({ "type": "number", "ref": 17 });
        let result = variable_result("n", "n", &record).unwrap();
        assert_eq!(result.display, "null");
        assert_eq!(result.handle, Some(17));
        assert_eq!(result.hex_display, None);
    }

    #[test]
    fn strings_are_quoted() {
        let record = serde_json::json!({ "type": "string", "value": "hi" });
        let result = variable_result("s", "s", &record).unwrap();
        assert_eq!(result.display, "\"hi\"");
        assert_eq!(result.kind, ValueKind::String);
    }

    #[test]
    fn date_objects_are_reclassified_and_not_expandable() {
        let record = serde_json::json!({
            "type": "object",
            "className": "Date",
            "value": "Mon Jan 06 2014",
            "ref": 3,
        });
        let result = variable_result("d", "d", &record).unwrap();
        assert_eq!(result.kind, ValueKind::Date);
        assert_eq!(result.display, "Mon Jan 06 2014");
        assert!(!result.expandable);
    }

    #[test]
    fn plain_objects_display_their_class_and_expand() {
        let record = serde_json::json!({ "type": "object", "className": "Buffer", "ref": 5 });
        let result = variable_result("b", "b", &record).unwrap();
        assert_eq!(result.kind, ValueKind::Object);
        assert_eq!(result.display, "Buffer");
        assert!(result.expandable);
    }

    #[test]
    fn function_display_prefers_name_then_inferred_name() {
        let named = serde_json::json!({ "type": "function", "name": "run", "ref": 1 });
        assert_eq!(variable_result("f", "f", &named).unwrap().display, "[Function: run]");

        let inferred = serde_json::json!({
            "type": "function", "name": "", "inferredName": "cb", "ref": 2,
        });
        assert_eq!(
            variable_result("f", "f", &inferred).unwrap().display,
            "[Function: cb]"
        );

        let anonymous = serde_json::json!({ "type": "function", "name": " ", "ref": 3 });
        assert_eq!(variable_result("f", "f", &anonymous).unwrap().display, "[Function]");
    }

    #[test]
    fn undefined_and_unknown_types_are_dropped() {
        assert!(variable_result("u", "u", &serde_json::json!({ "type": "undefined" })).is_none());
        assert!(variable_result("r", "r", &serde_json::json!({ "type": "regexp" })).is_none());
    }

    #[test]
    fn booleans_and_null_display_plainly() {
        let b = serde_json::json!({ "type": "boolean", "value": true });
        assert_eq!(variable_result("b", "b", &b).unwrap().display, "true");
        let n = serde_json::json!({ "type": "null" });
        let result = variable_result("n", "n", &n).unwrap();
        assert_eq!(result.display, "null");
        assert_eq!(result.kind, ValueKind::Null);
    }
}
