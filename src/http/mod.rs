//! HTTP-facing helpers shared by the static and dynamic branches.
//!
//! Decoupled from dispatch so the mime registry and the ETag index can be
//! kept warm for the whole process lifetime.

pub mod cache;
pub mod mime;

pub use cache::EtagIndex;
pub use mime::{MimeEntry, MimeRegistry, OCTET_STREAM};
