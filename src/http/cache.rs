//! Conditional-request support for static assets.
//!
//! An optional `conf/etags.json` manifest maps request paths to
//! precomputed ETag strings. The manifest is loaded once per process and
//! read-only thereafter. A request whose `if-none-match` header equals the
//! manifest tag short-circuits to 304 before any file read.

use once_cell::sync::OnceCell;
use std::collections::HashMap;

use crate::config::Settings;

/// Name of the manifest under `conf/`.
const ETAGS_CONF: &str = "etags.json";

/// Process-wide path -> etag manifest.
#[derive(Debug)]
pub struct EtagIndex {
    settings: Settings,
    entries: OnceCell<HashMap<String, String>>,
}

impl EtagIndex {
    pub fn new(settings: Settings) -> Self {
        Self { settings, entries: OnceCell::new() }
    }

    /// Manifest tag for a request path, normalized to a leading slash.
    pub fn lookup(&self, path: &str) -> Option<&str> {
        let entries = self.load();
        if path.starts_with('/') {
            entries.get(path).map(String::as_str)
        } else {
            entries.get(&format!("/{path}")).map(String::as_str)
        }
    }

    /// Whether the client's conditional header matches the manifest tag.
    pub fn matches(&self, path: &str, if_none_match: Option<&str>) -> bool {
        match (self.lookup(path), if_none_match) {
            (Some(tag), Some(header)) => tag == header,
            _ => false,
        }
    }

    fn load(&self) -> &HashMap<String, String> {
        self.entries.get_or_init(|| {
            let Some(conf) = self.settings.load_conf(ETAGS_CONF) else {
                return HashMap::new();
            };
            match serde_json::from_value(conf) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("ignoring malformed {ETAGS_CONF}: {e}");
                    HashMap::new()
                }
            }
        })
    }
}
