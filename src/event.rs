//! Normalized event types at the runtime boundary.
//!
//! The inbound shape follows the function-URL event convention: lower-cased
//! header keys, raw `name=value` cookie strings, and an optionally
//! base64-encoded body. The outbound shape is the structured result the
//! hosting layer serializes back to the client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inbound request event. Owned by the caller and never mutated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestEvent {
    pub raw_path: String,
    pub request_context: RequestContext,
    /// Header keys arrive lower-cased from the host.
    pub headers: HashMap<String, String>,
    /// Raw `name=value` cookie strings.
    pub cookies: Vec<String>,
    pub query_string_parameters: HashMap<String, String>,
    pub body: Option<String>,
    pub is_base64_encoded: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub http: HttpContext,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpContext {
    pub method: String,
    pub protocol: String,
}

/// Outbound structured result.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub headers: HashMap<String, String>,
    /// Fully serialized `Set-Cookie` strings.
    pub cookies: Vec<String>,
    pub is_base64_encoded: bool,
    pub body: String,
}
