//! Runtime settings and JSON config collaborators.
//!
//! Settings describe the on-disk application layout: a base directory with
//! `public/` (assets, scripts, templates), `lib/` (importable script
//! modules) and `conf/` (pure JSON lookups such as `mime.json` and
//! `etags.json`). An optional TOML file overrides the defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::RunletError;

/// Application layout settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base directory of the deployed application.
    pub base_path: PathBuf,
    /// Directory under the base holding public assets and dynamic code.
    pub public_dir: String,
    /// Directory under the base holding importable script modules.
    pub lib_dir: String,
    /// Directory under the base holding JSON config collaborators.
    pub conf_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            public_dir: default_public_dir(),
            lib_dir: default_lib_dir(),
            conf_dir: default_conf_dir(),
        }
    }
}

fn default_public_dir() -> String {
    "public".to_string()
}

fn default_lib_dir() -> String {
    "lib".to_string()
}

fn default_conf_dir() -> String {
    "conf".to_string()
}

impl Settings {
    /// Settings rooted at the given base directory, everything else default.
    pub fn with_base(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into(), ..Self::default() }
    }

    /// Load settings from a TOML file; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, RunletError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(RunletError::Io(e)),
        };
        toml::from_str(&text).map_err(|e| RunletError::Settings(e.to_string()))
    }

    pub fn public_path(&self) -> PathBuf {
        self.base_path.join(&self.public_dir)
    }

    pub fn lib_path(&self) -> PathBuf {
        self.base_path.join(&self.lib_dir)
    }

    pub fn conf_path(&self) -> PathBuf {
        self.base_path.join(&self.conf_dir)
    }

    /// Load a JSON config collaborator from `conf/`.
    ///
    /// Returns None when the file is absent. A file that exists but does
    /// not parse is reported and treated as absent as well: config lookups
    /// are pure collaborators and must never fail a request.
    pub fn load_conf(&self, name: &str) -> Option<serde_json::Value> {
        let name = name.trim().trim_start_matches('/');
        let path = self.conf_path().join(name);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("invalid json in {}: {e}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let settings = Settings::default();
        assert_eq!(settings.public_path(), PathBuf::from("./public"));
        assert_eq!(settings.lib_path(), PathBuf::from("./lib"));
        assert_eq!(settings.conf_path(), PathBuf::from("./conf"));
    }

    #[test]
    fn test_load_from_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from(Path::new("/nonexistent/runlet.toml")).unwrap();
        assert_eq!(settings.public_dir, "public");
    }

    #[test]
    fn test_load_conf_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/app.json"), r#"{"name":"demo"}"#).unwrap();

        let settings = Settings::with_base(dir.path());
        let conf = settings.load_conf("app.json").unwrap();
        assert_eq!(conf["name"], "demo");
        assert!(settings.load_conf("missing.json").is_none());
    }

    #[test]
    fn test_load_conf_invalid_json_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/bad.json"), "{not json").unwrap();

        let settings = Settings::with_base(dir.path());
        assert!(settings.load_conf("bad.json").is_none());
    }
}
