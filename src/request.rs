//! Per-invocation request view.
//!
//! Lazy, memoized accessors over the read-only inbound event. Each
//! accessor computes once on first use and caches for the rest of the
//! invocation. A fresh view is created for every invocation, so a warm
//! process never leaks state across requests.

use once_cell::unsync::OnceCell;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

use base64::Engine as _;

use crate::event::RequestEvent;

/// Extension of a request path, as the dispatcher classifies it.
///
/// Returns None for a trailing-slash path (no file name at all) and
/// `Some("")` when the final segment has no dot.
pub fn path_extension(path: &str) -> Option<String> {
    if path.ends_with('/') {
        return None;
    }
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rfind('.') {
        Some(dot) => Some(segment[dot + 1..].trim().to_lowercase()),
        None => Some(String::new()),
    }
}

/// Memoized view over one [`RequestEvent`].
#[derive(Debug)]
pub struct RequestView {
    event: RequestEvent,
    path: OnceCell<String>,
    extension: OnceCell<String>,
    method: OnceCell<String>,
    cookies: OnceCell<HashMap<String, String>>,
    params: OnceCell<serde_json::Value>,
    body: OnceCell<Option<Vec<u8>>>,
}

impl RequestView {
    pub fn new(event: RequestEvent) -> Self {
        Self {
            event,
            path: OnceCell::new(),
            extension: OnceCell::new(),
            method: OnceCell::new(),
            cookies: OnceCell::new(),
            params: OnceCell::new(),
            body: OnceCell::new(),
        }
    }

    /// Request path; a trailing slash resolves to the directory `index`.
    pub fn path(&self) -> &str {
        self.path.get_or_init(|| {
            let raw = &self.event.raw_path;
            if raw.ends_with('/') {
                format!("{raw}index")
            } else {
                raw.clone()
            }
        })
    }

    /// Lower-cased extension of [`Self::path`], empty when there is none.
    pub fn extension(&self) -> &str {
        self.extension
            .get_or_init(|| path_extension(self.path()).unwrap_or_default())
    }

    pub fn method(&self) -> &str {
        self.method
            .get_or_init(|| self.event.request_context.http.method.to_uppercase())
    }

    pub fn protocol(&self) -> &str {
        &self.event.request_context.http.protocol
    }

    /// Headers as delivered by the host (keys already lower-cased).
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.event.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.event.headers.get(&key.trim().to_lowercase()).map(String::as_str)
    }

    /// Cookies parsed from the raw `name=value` list, percent-decoded.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            let mut cookies = HashMap::new();
            for raw in &self.event.cookies {
                let decoded = percent_decode_str(raw).decode_utf8_lossy();
                match decoded.split_once('=') {
                    Some((name, value)) => {
                        cookies.insert(name.to_string(), value.to_string());
                    }
                    // A bare token is treated as a set flag.
                    None => {
                        cookies.insert(decoded.to_string(), "true".to_string());
                    }
                }
            }
            cookies
        })
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(String::as_str)
    }

    pub fn url_params(&self) -> &HashMap<String, String> {
        &self.event.query_string_parameters
    }

    /// Request parameters: query parameters for GET, otherwise the body
    /// decoded per its content type (JSON, form-encoded, or raw form
    /// fallback). Always a JSON object; undecodable bodies yield an empty
    /// one rather than failing the invocation.
    pub fn params(&self) -> &serde_json::Value {
        self.params.get_or_init(|| {
            if self.method() == "GET" {
                return map_to_json(self.url_params());
            }
            let Some(body) = self.body_bytes() else {
                return serde_json::Value::Object(serde_json::Map::new());
            };
            let content_type = self
                .header("content-type")
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
                .unwrap_or_default();
            let is_binary = self.event.is_base64_encoded;
            if content_type == "application/json" {
                let text = String::from_utf8_lossy(body);
                serde_json::from_str(&text).unwrap_or_else(|e| {
                    tracing::warn!("unparsable json body: {e}");
                    serde_json::Value::Object(serde_json::Map::new())
                })
            } else if content_type == "application/x-www-form-urlencoded" || !is_binary {
                parse_form(&String::from_utf8_lossy(body))
            } else {
                serde_json::Value::Object(serde_json::Map::new())
            }
        })
    }

    /// Raw body bytes, base64-decoded when the event is marked encoded.
    /// None for GET requests and body-less events.
    pub fn body(&self) -> Option<&[u8]> {
        if self.method() == "GET" {
            return None;
        }
        self.body_bytes()
    }

    fn body_bytes(&self) -> Option<&[u8]> {
        self.body
            .get_or_init(|| {
                let body = self.event.body.as_ref()?;
                if self.event.is_base64_encoded {
                    match base64::engine::general_purpose::STANDARD.decode(body) {
                        Ok(bytes) => Some(bytes),
                        Err(e) => {
                            tracing::warn!("undecodable base64 body: {e}");
                            None
                        }
                    }
                } else {
                    Some(body.clone().into_bytes())
                }
            })
            .as_deref()
    }

    /// Snapshot handed to dynamic code as the `request()` global.
    pub fn script_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "path": self.path(),
            "extension": self.extension(),
            "method": self.method(),
            "protocol": self.protocol(),
            "headers": self.headers(),
            "cookies": self.cookies(),
            "url_params": self.url_params(),
            "params": self.params(),
        })
    }
}

fn map_to_json(map: &HashMap<String, String>) -> serde_json::Value {
    let object = map
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    serde_json::Value::Object(object)
}

/// Decode a form-encoded parameter string into a JSON object.
fn parse_form(text: &str) -> serde_json::Value {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(text) {
        Ok(pairs) => serde_json::Value::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
        ),
        Err(e) => {
            tracing::warn!("unparsable form body: {e}");
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}
