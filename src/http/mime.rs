//! MIME type registry.
//!
//! Maps a lower-cased file extension to a content type and a gzip
//! eligibility flag. A built-in table covers the minimal set; an optional
//! `conf/mime.json` override table is loaded once and memoized for the
//! process lifetime, so resolution is idempotent across calls.

use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::Settings;

/// Content type used when no entry matches.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Name of the override table under `conf/`.
const MIME_CONF: &str = "mime.json";

/// Resolved mime entry for one extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeEntry {
    pub content_type: String,
    /// Whether on-the-fly gzip compression is worthwhile for this type.
    pub gzip: bool,
}

/// Shape of one `mime.json` override entry.
#[derive(Debug, Deserialize)]
struct MimeOverride {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    gz: bool,
}

/// Built-in table. Text formats compress, images do not.
fn builtin(extension: &str) -> Option<(&'static str, bool)> {
    match extension {
        "txt" => Some(("text/plain", true)),
        "htm" | "html" => Some(("text/html", true)),
        "xhtml" => Some(("application/xhtml+xml", true)),
        "xml" => Some(("text/xml", true)),
        "json" => Some(("application/json", true)),
        "css" => Some(("text/css", true)),
        "js" => Some(("text/javascript", true)),
        "gif" => Some(("image/gif", false)),
        "jpg" | "jpeg" => Some(("image/jpeg", false)),
        "png" => Some(("image/png", false)),
        "ico" => Some(("image/vnd.microsoft.icon", false)),
        _ => None,
    }
}

/// Process-wide mime registry: built-in table plus memoized overrides.
#[derive(Debug)]
pub struct MimeRegistry {
    settings: Settings,
    overrides: OnceCell<HashMap<String, MimeEntry>>,
}

impl MimeRegistry {
    pub fn new(settings: Settings) -> Self {
        Self { settings, overrides: OnceCell::new() }
    }

    /// Full entry for an extension, or None when unknown.
    pub fn entry(&self, extension: &str) -> Option<MimeEntry> {
        let extension = extension.trim().to_lowercase();
        if let Some((content_type, gzip)) = builtin(&extension) {
            return Some(MimeEntry { content_type: content_type.to_string(), gzip });
        }
        self.load_overrides().get(&extension).cloned()
    }

    /// Content type for an extension, `application/octet-stream` when unknown.
    pub fn content_type(&self, extension: &str) -> String {
        self.entry(extension)
            .map_or_else(|| OCTET_STREAM.to_string(), |entry| entry.content_type)
    }

    fn load_overrides(&self) -> &HashMap<String, MimeEntry> {
        self.overrides.get_or_init(|| {
            let Some(conf) = self.settings.load_conf(MIME_CONF) else {
                return HashMap::new();
            };
            match serde_json::from_value::<HashMap<String, MimeOverride>>(conf) {
                Ok(table) => table
                    .into_iter()
                    .map(|(ext, entry)| {
                        let resolved =
                            MimeEntry { content_type: entry.content_type, gzip: entry.gz };
                        (ext.to_lowercase(), resolved)
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!("ignoring malformed {MIME_CONF}: {e}");
                    HashMap::new()
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_without_overrides() -> MimeRegistry {
        let dir = tempfile::tempdir().unwrap();
        MimeRegistry::new(Settings::with_base(dir.path()))
    }

    #[test]
    fn test_builtin_types() {
        let registry = registry_without_overrides();
        assert_eq!(registry.content_type("html"), "text/html");
        assert_eq!(registry.content_type("json"), "application/json");
        assert_eq!(registry.content_type("png"), "image/png");
        assert!(registry.entry("html").unwrap().gzip);
        assert!(!registry.entry("png").unwrap().gzip);
    }

    #[test]
    fn test_unknown_extension() {
        let registry = registry_without_overrides();
        assert_eq!(registry.content_type("xyz"), OCTET_STREAM);
        assert!(registry.entry("xyz").is_none());
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let registry = registry_without_overrides();
        assert_eq!(registry.content_type("HTML"), "text/html");
    }

    #[test]
    fn test_overrides_from_conf() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(
            dir.path().join("conf/mime.json"),
            r#"{"wasm": {"type": "application/wasm", "gz": true}}"#,
        )
        .unwrap();

        let registry = MimeRegistry::new(Settings::with_base(dir.path()));
        let entry = registry.entry("wasm").unwrap();
        assert_eq!(entry.content_type, "application/wasm");
        assert!(entry.gzip);
        // Built-ins win over overrides and resolution stays idempotent.
        assert_eq!(registry.content_type("html"), "text/html");
        assert_eq!(registry.entry("wasm"), registry.entry("wasm"));
    }
}
