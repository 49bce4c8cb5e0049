//! Wire message types
//!
//! Packet types are distinguished by the JSON `type` field: `request`,
//! `response` or `event`. Bodies whose shape the engine keeps stable get
//! typed structs; everything else stays a `serde_json::Value` because the
//! engine is loose about optional fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request packet
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn new(seq: i64, command: &str, arguments: Option<Value>) -> Self {
        Self {
            seq,
            message_type: "request",
            command: command.to_string(),
            arguments,
        }
    }
}

/// Inbound response packet
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub request_seq: i64,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Records referenced by the body, indexed by handle
    #[serde(default)]
    pub refs: Option<Value>,
    /// Whether the debuggee kept running after this command
    #[serde(default)]
    pub running: bool,
}

/// `setbreakpoint` response body
///
/// This corner of the protocol is snake_case (`script_id`,
/// `actual_locations`), unlike the camelCase used elsewhere.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakpointSetBody {
    /// Engine breakpoint id
    pub breakpoint: i64,
    #[serde(default)]
    pub script_id: Option<i64>,
    #[serde(default)]
    pub actual_locations: Vec<ActualLocation>,
}

/// Where the engine actually placed a breakpoint (zero-based coordinates)
#[derive(Debug, Clone, Deserialize)]
pub struct ActualLocation {
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default)]
    pub script_id: Option<i64>,
}

/// One entry of the `scripts` response body
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}
