//! Runlet - request-serving core of a minimal serverless web runtime
//!
//! Given a normalized HTTP-like event, the [`dispatch::Runtime`] decides
//! whether the target is a static asset, a one-shot pre-request filter
//! script, or a dynamic page; executes the chosen dynamic code inside a
//! constrained scripting scope; and converts whatever that code produces
//! into a structured response (status, headers, cookies, body, encoding).
//!
//! Dynamic code is written in the Rhai dialect. Server-rendered pages are
//! authored in a hybrid markup/script format that the [`template`] compiler
//! turns into the same dialect, so pages reduce to the same execution path
//! as plain scripts.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod http;
pub mod request;
pub mod response;
pub mod script;
pub mod template;

pub use config::Settings;
pub use dispatch::Runtime;
pub use error::RunletError;
pub use event::{RequestEvent, ResponseEvent};
