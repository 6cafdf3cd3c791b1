//! Per-invocation response builder.
//!
//! A mutable, single-slot accumulator for status, headers, cookies and
//! body. Header keys are case-insensitive (stored lower-cased,
//! last-write-wins). Every serialized cookie carries exactly one
//! `SameSite` attribute; `samesite=lax` is injected when the author did
//! not set one. An untouched builder snapshots to a default 200/empty
//! response.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;

/// Percent-encoding set for cookie names and values: everything except
/// the characters `encodeURIComponent` leaves alone.
const COOKIE_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Response body in one of the shapes dynamic code can produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    None,
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// One cookie attribute: a bare flag (`Secure`) or a valued pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieAttr {
    Flag,
    Value(String),
}

/// A cookie value plus its attributes, keys lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub value: String,
    pub attributes: BTreeMap<String, CookieAttr>,
}

impl Cookie {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), attributes: BTreeMap::new() }
    }

    /// Parse the `"value; Max-Age=2592000; Secure"` shorthand. The first
    /// segment is always the value.
    pub fn parse(text: &str) -> Self {
        let mut segments = text.split(';');
        let value = segments.next().unwrap_or_default().trim().to_string();
        let mut cookie = Self::new(value);
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((key, value)) => {
                    cookie
                        .attributes
                        .insert(key.trim().to_lowercase(), CookieAttr::Value(value.trim().to_string()));
                }
                None => {
                    cookie.attributes.insert(segment.to_lowercase(), CookieAttr::Flag);
                }
            }
        }
        cookie
    }

    /// Serialize to a `Set-Cookie` string, injecting `samesite=lax` when
    /// the author did not pick a same-site policy.
    pub fn serialize(&self, name: &str) -> String {
        let mut out = format!(
            "{}={}",
            utf8_percent_encode(name, COOKIE_COMPONENT),
            utf8_percent_encode(&self.value, COOKIE_COMPONENT)
        );
        for (key, attr) in &self.attributes {
            match attr {
                CookieAttr::Flag => {
                    out.push_str("; ");
                    out.push_str(key);
                }
                CookieAttr::Value(value) => {
                    out.push_str("; ");
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
            }
        }
        if !self.attributes.contains_key("samesite") {
            out.push_str("; samesite=lax");
        }
        out
    }
}

/// Immutable snapshot of a builder.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseState {
    pub status: u16,
    pub message: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, Cookie>,
    pub body: Body,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: 200,
            message: None,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: Body::None,
        }
    }
}

impl ResponseState {
    /// The implicit result of dynamic code that never touched the builder.
    pub fn ok_default() -> Self {
        Self { message: Some("ok".to_string()), ..Self::default() }
    }

    pub fn serialized_cookies(&self) -> Vec<String> {
        self.cookies.iter().map(|(name, cookie)| cookie.serialize(name)).collect()
    }
}

/// Mutable response accumulator, one per invocation. The dispatcher
/// threads the same builder through the filter and handler stages.
#[derive(Debug, Clone, Default)]
pub struct ResponseBuilder {
    state: ResponseState,
    touched: bool,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any mutator ran during this invocation.
    pub fn touched(&self) -> bool {
        self.touched
    }

    pub fn snapshot(&self) -> ResponseState {
        self.state.clone()
    }

    pub fn status(&mut self, code: u16) {
        self.touched = true;
        self.state.status = code;
        self.state.message = None;
    }

    pub fn status_with_message(&mut self, code: u16, message: impl Into<String>) {
        self.touched = true;
        self.state.status = code;
        self.state.message = Some(message.into());
    }

    /// Set a header; keys are lower-cased, last write wins.
    pub fn header(&mut self, key: &str, value: impl Into<String>) {
        self.touched = true;
        self.state.headers.insert(key.trim().to_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, key: &str) {
        self.touched = true;
        self.state.headers.remove(&key.trim().to_lowercase());
    }

    pub fn content_type(&mut self, mime: &str, charset: Option<&str>) {
        let value = match charset {
            Some(charset) if !charset.is_empty() => format!("{mime}; charset={charset}"),
            _ => mime.to_string(),
        };
        self.header("content-type", value);
    }

    pub fn cookie(&mut self, name: &str, cookie: Cookie) {
        self.touched = true;
        self.state.cookies.insert(name.trim().to_lowercase(), cookie);
    }

    pub fn body(&mut self, body: Body) {
        self.touched = true;
        self.state.body = body;
    }

    /// Redirect to `url`, appending optional query parameters. The default
    /// status is 301.
    pub fn redirect(&mut self, url: &str, params: Option<&BTreeMap<String, String>>, status: Option<u16>) {
        let mut target = url.to_string();
        if let Some(params) = params {
            if !params.is_empty() {
                let query = serde_urlencoded::to_string(params).unwrap_or_default();
                target.push(if target.contains('?') { '&' } else { '?' });
                target.push_str(&query);
            }
        }
        self.header("location", target);
        self.status(status.unwrap_or(301));
        self.body(Body::Text(String::new()));
    }
}
