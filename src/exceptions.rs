//! Exception filtering
//!
//! Every exception name maps to a treatment; the engine itself only knows
//! "break on all" vs "don't", so the table is collapsed into a single
//! `setexceptionbreak` flag that is re-sent whenever the effective value
//! changes.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::common::{Error, Result};
use crate::events::DebugEvent;
use crate::session::Session;

/// How a raised exception of a given name is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionTreatment {
    /// Resume silently
    BreakNever,
    /// Stop and surface the exception
    BreakAlways,
    /// Reserved: the engine reports no reliable uncaught signal over this
    /// protocol, so storing this variant is rejected at runtime.
    BreakOnUnhandled,
}

/// Well-known error constructors
const WELL_KNOWN: &[&str] = &[
    "Error",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
];

/// POSIX errno codes surfaced as `Error(Exxx)`
const ERRNO_CODES: &[&str] = &[
    "EACCES", "EADDRINUSE", "EADDRNOTAVAIL", "EAFNOSUPPORT", "EAGAIN", "EWOULDBLOCK", "EALREADY",
    "EBADF", "EBADMSG", "EBUSY", "ECANCELED", "ECHILD", "ECONNABORTED", "ECONNREFUSED",
    "ECONNRESET", "EDEADLK", "EDESTADDRREQ", "EDOM", "EEXIST", "EFAULT", "EFBIG", "EHOSTUNREACH",
    "EIDRM", "EILSEQ", "EINPROGRESS", "EINTR", "EINVAL", "EIO", "EISCONN", "EISDIR", "ELOOP",
    "EMFILE", "EMLINK", "EMSGSIZE", "ENAMETOOLONG", "ENETDOWN", "ENETRESET", "ENETUNREACH",
    "ENFILE", "ENOBUFS", "ENODATA", "ENODEV", "ENOENT", "ENOEXEC", "ENOLINK", "ENOLCK", "ENOMEM",
    "ENOMSG", "ENOPROTOOPT", "ENOSPC", "ENOSR", "ENOSTR", "ENOSYS", "ENOTCONN", "ENOTDIR",
    "ENOTEMPTY", "ENOTSOCK", "ENOTSUP", "ENOTTY", "ENXIO", "EOVERFLOW", "EPERM", "EPIPE",
    "EPROTO", "EPROTONOSUPPORT", "EPROTOTYPE", "ERANGE", "EROFS", "ESPIPE", "ESRCH", "ETIME",
    "ETIMEDOUT", "ETXTBSY", "EXDEV",
];

/// Signal names surfaced as `Error(SIGxxx)`
const SIGNAL_CODES: &[&str] = &[
    "SIGHUP", "SIGINT", "SIGILL", "SIGABRT", "SIGFPE", "SIGKILL", "SIGSEGV", "SIGTERM",
    "SIGBREAK", "SIGWINCH",
];

fn default_treatments() -> HashMap<String, ExceptionTreatment> {
    let mut table = HashMap::new();
    for name in WELL_KNOWN {
        table.insert((*name).to_string(), ExceptionTreatment::BreakAlways);
    }
    for code in ERRNO_CODES.iter().chain(SIGNAL_CODES) {
        table.insert(format!("Error({code})"), ExceptionTreatment::BreakAlways);
    }
    // File-not-found fires constantly in module resolution; off by default.
    table.insert("Error(ENOENT)".to_string(), ExceptionTreatment::BreakNever);
    table
}

/// Per-kind treatment table plus the last wire state sent to the engine
#[derive(Debug, Clone)]
pub(crate) struct ExceptionTable {
    default: ExceptionTreatment,
    entries: HashMap<String, ExceptionTreatment>,
    pub(crate) break_on_all_sent: bool,
    pub(crate) break_on_uncaught_sent: bool,
}

impl ExceptionTable {
    pub fn with_defaults() -> Self {
        Self {
            default: ExceptionTreatment::BreakAlways,
            entries: default_treatments(),
            break_on_all_sent: false,
            break_on_uncaught_sent: false,
        }
    }

    /// Effective treatment for an exception name
    pub fn effective(&self, name: &str) -> ExceptionTreatment {
        *self.entries.get(name).unwrap_or(&self.default)
    }

    /// Store a treatment; returns whether anything changed
    pub fn set(&mut self, name: &str, treatment: ExceptionTreatment) -> Result<bool> {
        reject_unhandled(treatment)?;
        Ok(self.entries.insert(name.to_string(), treatment) != Some(treatment))
    }

    pub fn set_default(&mut self, treatment: ExceptionTreatment) -> Result<bool> {
        reject_unhandled(treatment)?;
        let changed = self.default != treatment;
        self.default = treatment;
        Ok(changed)
    }

    /// Drop an explicit entry so the name falls back to the default
    pub fn clear(&mut self, name: &str) -> bool {
        match self.entries.remove(name) {
            Some(old) => old != self.default,
            None => false,
        }
    }

    /// Reset table and default to the built-in defaults
    ///
    /// The last-sent wire flags survive: they describe the engine, not the
    /// table.
    pub fn clear_all(&mut self) {
        self.default = ExceptionTreatment::BreakAlways;
        self.entries = default_treatments();
    }

    /// Whether the engine should break on thrown exceptions at all
    pub fn derive_break_on_all(&self) -> bool {
        self.default != ExceptionTreatment::BreakNever
            || self
                .entries
                .values()
                .any(|t| *t != ExceptionTreatment::BreakNever)
    }

    /// Kept symmetrical with `derive_break_on_all`; the engine's uncaught
    /// signal is unusable, so this never becomes true.
    pub fn derive_break_on_uncaught(&self) -> bool {
        false
    }
}

fn reject_unhandled(treatment: ExceptionTreatment) -> Result<()> {
    if treatment == ExceptionTreatment::BreakOnUnhandled {
        return Err(Error::UnsupportedTreatment);
    }
    Ok(())
}

impl Session {
    /// Set the treatment for one exception name
    pub async fn set_exception_treatment(
        &self,
        name: &str,
        treatment: ExceptionTreatment,
    ) -> Result<()> {
        let changed = self.state().exceptions.set(name, treatment)?;
        if changed {
            self.sync_exception_break(true).await?;
        }
        Ok(())
    }

    /// Set the fallback treatment for names without an explicit entry
    pub async fn set_default_exception_treatment(
        &self,
        treatment: ExceptionTreatment,
    ) -> Result<()> {
        let changed = self.state().exceptions.set_default(treatment)?;
        if changed {
            self.sync_exception_break(true).await?;
        }
        Ok(())
    }

    /// Drop the explicit entry for one exception name
    pub async fn clear_exception_treatment(&self, name: &str) -> Result<()> {
        let changed = self.state().exceptions.clear(name);
        if changed {
            self.sync_exception_break(true).await?;
        }
        Ok(())
    }

    /// Reset all treatments to the built-in defaults
    pub async fn reset_exception_treatments(&self) -> Result<()> {
        self.state().exceptions.clear_all();
        self.sync_exception_break(true).await
    }

    /// Push the derived break-on-exception flags to the engine if they
    /// changed since the last send
    pub(crate) async fn sync_exception_break(&self, synchronous: bool) -> Result<()> {
        let (want_all, want_uncaught, sent_all, sent_uncaught) = {
            let state = self.state();
            (
                state.exceptions.derive_break_on_all(),
                state.exceptions.derive_break_on_uncaught(),
                state.exceptions.break_on_all_sent,
                state.exceptions.break_on_uncaught_sent,
            )
        };

        if want_all != sent_all {
            self.send_exception_break("all", want_all, synchronous).await?;
            self.state().exceptions.break_on_all_sent = want_all;
        }
        if want_uncaught != sent_uncaught {
            self.send_exception_break("uncaught", want_uncaught, synchronous)
                .await?;
            self.state().exceptions.break_on_uncaught_sent = want_uncaught;
        }
        Ok(())
    }

    async fn send_exception_break(
        &self,
        kind: &str,
        enabled: bool,
        synchronous: bool,
    ) -> Result<()> {
        let args = json!({ "type": kind, "enabled": enabled });
        if synchronous {
            self.router
                .request_with("setexceptionbreak", Some(args), self.sync_timeout(), || {
                    self.has_exited()
                })
                .await?;
        } else {
            self.router.post("setexceptionbreak", Some(args)).await?;
        }
        Ok(())
    }

    /// Inbound `exception` event
    pub(crate) async fn on_exception(&self, event: &Value) {
        let body = event.get("body").cloned().unwrap_or(Value::Null);
        let uncaught = body
            .get("uncaught")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let exception = body.get("exception").cloned().unwrap_or(Value::Null);

        let mut name = exception
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Error")
            .to_string();

        // Generic `error`/`object` types are upgraded to the constructor name.
        if name == "error" || name == "object" {
            if let Some(ctor) = exception
                .pointer("/constructorFunction/ref")
                .and_then(Value::as_i64)
                .and_then(|r| find_ref(event, r))
            {
                if let Some(ctor_name) = ctor.get("name").and_then(Value::as_str) {
                    name = ctor_name.to_string();
                }
            }
        }

        if let Some(code_handle) = exception
            .get("properties")
            .and_then(Value::as_array)
            .and_then(|props| {
                props
                    .iter()
                    .find(|p| p.get("name").and_then(Value::as_str) == Some("code"))
            })
            .and_then(|p| p.get("ref"))
            .and_then(Value::as_i64)
        {
            if let Some(code) = self.resolve_error_code(code_handle).await {
                name = format!("{name}({code})");
            }
        }

        let treatment = self.state().exceptions.effective(&name);
        if treatment == ExceptionTreatment::BreakNever {
            tracing::debug!(exception = %name, "exception filtered; resuming");
            self.auto_resume(true).await;
            return;
        }

        let description = exception
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        match self.perform_backtrace().await {
            Ok(_) => self.events.emit(DebugEvent::ExceptionRaised {
                name,
                description,
                uncaught,
            }),
            Err(err) => tracing::warn!(%err, "backtrace after exception failed"),
        }
    }

    /// Translate a `code` property handle to its string, through the cache
    async fn resolve_error_code(&self, handle: i64) -> Option<String> {
        if let Some(code) = self.state().error_codes.get(&handle).cloned() {
            return Some(code);
        }
        let response = self
            .router
            .request(
                "lookup",
                Some(json!({ "handles": [handle], "includeSource": false })),
            )
            .await
            .ok()?;
        let body = response.body?;
        let record = body.get(handle.to_string())?;
        let code = record
            .get("value")
            .and_then(Value::as_str)
            .or_else(|| record.get("text").and_then(Value::as_str))?
            .to_string();
        self.state().error_codes.insert(handle, code.clone());
        Some(code)
    }
}

/// Find a record in the event's `refs` array by handle
fn find_ref(event: &Value, handle: i64) -> Option<&Value> {
    event
        .get("refs")
        .and_then(Value::as_array)?
        .iter()
        .find(|r| r.get("handle").and_then(Value::as_i64) == Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_breaks_on_everything_but_enoent() {
        let table = ExceptionTable::with_defaults();
        assert_eq!(table.effective("TypeError"), ExceptionTreatment::BreakAlways);
        assert_eq!(
            table.effective("Error(EACCES)"),
            ExceptionTreatment::BreakAlways
        );
        assert_eq!(
            table.effective("Error(SIGSEGV)"),
            ExceptionTreatment::BreakAlways
        );
        assert_eq!(
            table.effective("Error(ENOENT)"),
            ExceptionTreatment::BreakNever
        );
        // Unknown names fall back to the default.
        assert_eq!(
            table.effective("SomethingCustom"),
            ExceptionTreatment::BreakAlways
        );
        assert!(table.derive_break_on_all());
        assert!(!table.derive_break_on_uncaught());
    }

    #[test]
    fn break_on_all_goes_false_only_when_everything_is_never() {
        let mut table = ExceptionTable::with_defaults();
        table.set_default(ExceptionTreatment::BreakNever).unwrap();
        assert!(table.derive_break_on_all());

        let names: Vec<String> = table.entries.keys().cloned().collect();
        for name in names {
            table.set(&name, ExceptionTreatment::BreakNever).unwrap();
        }
        assert!(!table.derive_break_on_all());

        table.set("TypeError", ExceptionTreatment::BreakAlways).unwrap();
        assert!(table.derive_break_on_all());
    }

    #[test]
    fn storing_break_on_unhandled_is_rejected() {
        let mut table = ExceptionTable::with_defaults();
        assert!(matches!(
            table.set("Error", ExceptionTreatment::BreakOnUnhandled),
            Err(Error::UnsupportedTreatment)
        ));
        assert!(matches!(
            table.set_default(ExceptionTreatment::BreakOnUnhandled),
            Err(Error::UnsupportedTreatment)
        ));
        // The table is untouched by the rejection.
        assert_eq!(table.effective("Error"), ExceptionTreatment::BreakAlways);
    }

    #[test]
    fn set_and_clear_report_effective_changes() {
        let mut table = ExceptionTable::with_defaults();
        assert!(table.set("TypeError", ExceptionTreatment::BreakNever).unwrap());
        assert!(!table.set("TypeError", ExceptionTreatment::BreakNever).unwrap());
        assert!(table.clear("TypeError"));
        assert_eq!(table.effective("TypeError"), ExceptionTreatment::BreakAlways);
        assert!(!table.clear("NoSuchEntry"));
    }

    #[test]
    fn clear_all_restores_the_defaults() {
        let mut table = ExceptionTable::with_defaults();
        table.set("Error(ENOENT)", ExceptionTreatment::BreakAlways).unwrap();
        table.break_on_all_sent = true;
        table.clear_all();
        assert_eq!(
            table.effective("Error(ENOENT)"),
            ExceptionTreatment::BreakNever
        );
        // Wire state describes the engine and survives the reset.
        assert!(table.break_on_all_sent);
    }
}
