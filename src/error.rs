//! Error types shared across the runtime.
//!
//! Reserved-path rejections, missing files and conditional matches are
//! dispatch outcomes and turn into responses directly; only failures that
//! cross a component boundary are represented here.

use thiserror::Error;

/// Failures surfaced by script execution, configuration loading and I/O.
#[derive(Debug, Error)]
pub enum RunletError {
    /// A typed HTTP error raised by dynamic code via `http_error(..)`.
    #[error("{message}")]
    Http { status: u16, message: String },

    /// Parse failure, missing entry point or untyped throw in a script.
    #[error("script failed: {0}")]
    Script(String),

    /// Invalid runtime settings file.
    #[error("settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunletError {
    /// Typed HTTP error constructor, mirroring the `http_error` script global.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http { status, message: message.into() }
    }
}
