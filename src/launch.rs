//! Debuggee process launch
//!
//! The interpreter is started with `--debug-brk=<port>` so it halts on the
//! first line of user code and waits for this client. Environment variables
//! arrive from launchers as one NUL-separated `KEY=VALUE` string.

use std::path::PathBuf;

use tokio::process::{Child, Command};

use crate::common::{Error, Result};

/// Options for launching a script under the debugger
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub script: PathBuf,
    pub script_args: Vec<String>,
    /// Extra interpreter options, placed before the script
    pub interpreter_options: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// NUL-separated `KEY=VALUE` environment block
    pub env_block: Option<String>,
    /// Debug port the interpreter will listen on
    pub port: u16,
    /// Explicit interpreter path; PATH lookup otherwise
    pub node_exe: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            script_args: Vec::new(),
            interpreter_options: Vec::new(),
            working_dir: None,
            env_block: None,
            port: 5858,
            node_exe: None,
        }
    }
}

/// Split a NUL-separated `KEY=VALUE` block
///
/// Entries with an empty name are skipped; only the first `=` splits.
pub fn parse_env_block(block: &str) -> Vec<(String, String)> {
    block
        .split('\0')
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Spawn the interpreter with the debug port armed
pub fn spawn_debuggee(options: &LaunchOptions) -> Result<Child> {
    let node = match &options.node_exe {
        Some(path) => path.clone(),
        None => which::which("node")
            .map_err(|err| Error::LaunchFailed(format!("node interpreter not found: {err}")))?,
    };

    let mut cmd = Command::new(node);
    cmd.arg(format!("--debug-brk={}", options.port));
    cmd.args(&options.interpreter_options);
    cmd.arg(&options.script);
    cmd.args(&options.script_args);
    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }
    if let Some(block) = &options.env_block {
        for (key, value) in parse_env_block(block) {
            cmd.env(key, value);
        }
    }
    cmd.kill_on_drop(true);

    cmd.spawn()
        .map_err(|err| Error::LaunchFailed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_block_splits_on_the_first_equals() {
        let parsed = parse_env_block("PATH=/usr/bin\0OPTS=a=b=c");
        assert_eq!(
            parsed,
            vec![
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("OPTS".to_string(), "a=b=c".to_string()),
            ]
        );
    }

    #[test]
    fn env_block_skips_empty_names_and_junk() {
        let parsed = parse_env_block("=orphan\0\0no_equals\0OK=1");
        assert_eq!(parsed, vec![("OK".to_string(), "1".to_string())]);
    }

    #[test]
    fn env_block_allows_empty_values() {
        let parsed = parse_env_block("EMPTY=");
        assert_eq!(parsed, vec![("EMPTY".to_string(), String::new())]);
    }
}
