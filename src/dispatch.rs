//! Request dispatcher.
//!
//! Classifies each inbound event by the raw path's extension and routes it
//! to the static pipeline (known file extension), the dynamic pipeline (no
//! extension, or the page extension), or an early rejection for reserved
//! paths. An optional pre-request filter script runs before either
//! pipeline and can veto the request.
//!
//! Static responses lean on caching (manifest ETags, conditional 304s,
//! precompressed or on-the-fly gzip). Dynamic responses are forced
//! uncacheable.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::error::RunletError;
use crate::event::{RequestEvent, ResponseEvent};
use crate::http::{EtagIndex, MimeRegistry, OCTET_STREAM};
use crate::request::{path_extension, RequestView};
use crate::response::{Body, ResponseBuilder, ResponseState};
use crate::script::{self, ReturnValue};
use crate::template::{self, COMPILED_SUFFIX, PAGE_EXTENSION, SCRIPT_SUFFIX, TEMPLATE_SUFFIX};

/// File name of the optional pre-request filter under `public/`.
const FILTER_FILE: &str = "filter.rt.rhai";

/// Long-lived per-process state shared across invocations.
#[derive(Debug)]
pub struct Runtime {
    settings: Arc<Settings>,
    mime: Arc<MimeRegistry>,
    etags: Arc<EtagIndex>,
}

impl Runtime {
    pub fn new(settings: Settings) -> Self {
        let mime = Arc::new(MimeRegistry::new(settings.clone()));
        let etags = Arc::new(EtagIndex::new(settings.clone()));
        Self { settings: Arc::new(settings), mime, etags }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Serve one inbound event. Never fails: every error becomes a
    /// structured error response.
    pub async fn handle(&self, event: RequestEvent) -> ResponseEvent {
        let raw_path = event.raw_path.clone();
        let extension = path_extension(&raw_path);
        debug!(path = %raw_path, "dispatch");

        // Source files of the dynamic pipeline are never served raw.
        if is_reserved_path(&raw_path) {
            warn!(path = %raw_path, "reserved path");
            return self.static_error(403, extension.as_deref());
        }

        let view = RequestView::new(event);
        let builder = ResponseBuilder::new();
        let builder = match self.run_filter(&view, extension.as_deref(), builder).await {
            Ok(builder) => builder,
            Err(rejection) => return rejection,
        };

        match extension.as_deref() {
            Some(ext) if !ext.is_empty() && ext != PAGE_EXTENSION => {
                self.serve_static(&raw_path, &view).await
            }
            Some(ext) => {
                self.serve_dynamic(&raw_path, ext == PAGE_EXTENSION, &view, builder).await
            }
            None => self.serve_static(&raw_path, &view).await,
        }
    }

    /// Run the pre-request filter, if deployed. On pass the builder comes
    /// back for the next stage, carrying any state the filter wrote (e.g. a
    /// refreshed cookie). On veto the terminal response is returned.
    async fn run_filter(
        &self,
        view: &RequestView,
        extension: Option<&str>,
        builder: ResponseBuilder,
    ) -> Result<ResponseBuilder, ResponseEvent> {
        let path = self.settings.public_path().join(FILTER_FILE);
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(builder),
            Err(e) => {
                error!("unreadable filter: {e}");
                return Err(self.static_error(500, extension));
            }
        };
        let is_page = extension == Some(PAGE_EXTENSION);
        let payload = view.script_payload();
        let body = view.body().map(<[u8]>::to_vec);
        match script::run(&source, &path, payload, body, builder, &self.settings, &self.mime) {
            Ok(exec) => {
                if exec.returned == ReturnValue::Bool(true) {
                    return Ok(exec.builder);
                }
                warn!(path = %view.path(), "filter rejected request");
                if exec.builder.touched() {
                    // The filter's own verdict, e.g. a redirect to a login
                    // page.
                    Err(shape_response(exec.builder.snapshot(), is_page))
                } else {
                    Err(self.static_error(403, extension))
                }
            }
            Err(err) => {
                error!("filter failed: {err}");
                Err(dynamic_error(&err, is_page))
            }
        }
    }

    /// Static pipeline: directory index rewrite, manifest ETag, conditional
    /// 304, precompressed sibling or on-the-fly gzip.
    async fn serve_static(&self, raw_path: &str, view: &RequestView) -> ResponseEvent {
        let public = self.settings.public_path();
        let mut relative = raw_path.trim_start_matches('/').replace("..", "");
        let mut extension = path_extension(raw_path).unwrap_or_default();

        if raw_path.ends_with('/') {
            // Prefer index.html (plain or precompressed), fall back to
            // index.htm.
            let html = public.join(format!("{relative}index.html"));
            let html_gz = public.join(format!("{relative}index.html.gz"));
            if exists(&html).await || exists(&html_gz).await {
                relative.push_str("index.html");
            } else {
                relative.push_str("index.htm");
            }
            extension = "html".to_string();
        }

        let mut headers = HashMap::new();
        headers.insert("expires".to_string(), "-1".to_string());
        let entry = self.mime.entry(&extension);
        let content_type = entry
            .as_ref()
            .map_or_else(|| OCTET_STREAM.to_string(), |e| e.content_type.clone());
        headers.insert("content-type".to_string(), content_type);
        if let Some(tag) = self.etags.lookup(&relative) {
            headers.insert("etag".to_string(), tag.to_string());
        }

        if self.etags.matches(&relative, view.header("if-none-match")) {
            debug!(path = %relative, "etag match");
            return ResponseEvent {
                status_code: 304,
                status_message: None,
                headers,
                cookies: Vec::new(),
                is_base64_encoded: false,
                body: String::new(),
            };
        }

        let target = public.join(&relative);

        // A precompressed sibling is served as-is, whatever the type says.
        let sibling = PathBuf::from(format!("{}.gz", target.display()));
        if let Ok(bytes) = tokio::fs::read(&sibling).await {
            headers.insert("content-encoding".to_string(), "gzip".to_string());
            return ok_static(headers, &bytes);
        }

        let bytes = match tokio::fs::read(&target).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %relative, "static asset not found");
                return self.static_error(404, Some(&extension));
            }
            Err(e) => {
                error!("unreadable static asset {}: {e}", target.display());
                return self.static_error(500, Some(&extension));
            }
        };

        if entry.is_some_and(|e| e.gzip) {
            match gzip(&bytes) {
                Ok(compressed) => {
                    headers.insert("content-encoding".to_string(), "gzip".to_string());
                    return ok_static(headers, &compressed);
                }
                Err(e) => {
                    error!("gzip failed for {}: {e}", target.display());
                    return self.static_error(500, Some(&extension));
                }
            }
        }
        ok_static(headers, &bytes)
    }

    /// Dynamic pipeline: resolve the source unit, compile templates on
    /// demand, execute, then merge the returned value into the response.
    async fn serve_dynamic(
        &self,
        raw_path: &str,
        is_page: bool,
        view: &RequestView,
        builder: ResponseBuilder,
    ) -> ResponseEvent {
        let public = self.settings.public_path();
        let relative = raw_path.trim_start_matches('/').trim().replace("..", "");

        let (source_path, needs_compile) = if is_page {
            let stem = relative
                .strip_suffix(&format!(".{PAGE_EXTENSION}"))
                .unwrap_or(&relative);
            let compiled = public.join(format!("{stem}{COMPILED_SUFFIX}"));
            if exists(&compiled).await {
                (compiled, false)
            } else {
                (public.join(format!("{stem}{TEMPLATE_SUFFIX}")), true)
            }
        } else {
            (public.join(format!("{relative}{SCRIPT_SUFFIX}")), false)
        };

        let source = match tokio::fs::read_to_string(&source_path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %raw_path, "no dynamic unit");
                return dynamic_error(&RunletError::http(404, "Not Found"), is_page);
            }
            Err(e) => {
                error!("unreadable dynamic unit {}: {e}", source_path.display());
                return dynamic_error(&RunletError::http(500, "Internal Server Error"), is_page);
            }
        };
        let source = if needs_compile { template::compile(&source) } else { source };

        let payload = view.script_payload();
        let body = view.body().map(<[u8]>::to_vec);
        match script::run(&source, &source_path, payload, body, builder, &self.settings, &self.mime) {
            Ok(exec) => {
                let mut state = if exec.builder.touched() {
                    exec.builder.snapshot()
                } else {
                    ResponseState::ok_default()
                };
                // The returned value becomes the body only when the script
                // did not set one explicitly.
                if state.body.is_none() {
                    state.body = match exec.returned {
                        ReturnValue::Text(text) => Body::Text(text),
                        ReturnValue::Binary(bytes) => Body::Binary(bytes),
                        ReturnValue::Json(json) => Body::Json(json),
                        _ => Body::None,
                    };
                }
                force_uncacheable(&mut state);
                shape_response(state, is_page)
            }
            Err(err) => {
                error!("dynamic unit {} failed: {err}", source_path.display());
                dynamic_error(&err, is_page)
            }
        }
    }

    /// Asset-flavored error: an empty body typed like the requested asset,
    /// or a tiny text marker when the extension is unknown.
    fn static_error(&self, status: u16, extension: Option<&str>) -> ResponseEvent {
        let mut headers = HashMap::new();
        let body = match extension.and_then(|ext| self.mime.entry(ext)) {
            Some(entry) => {
                headers.insert("content-type".to_string(), entry.content_type);
                String::new()
            }
            None => {
                headers.insert("content-type".to_string(), "text".to_string());
                format!("error: {status}")
            }
        };
        ResponseEvent {
            status_code: status,
            status_message: None,
            headers,
            cookies: Vec::new(),
            is_base64_encoded: false,
            body,
        }
    }
}

/// Whether the raw path targets dynamic source material directly.
fn is_reserved_path(path: &str) -> bool {
    path.ends_with("/filter")
        || path.ends_with(SCRIPT_SUFFIX)
        || path.ends_with(COMPILED_SUFFIX)
        || path.ends_with(TEMPLATE_SUFFIX)
}

/// Error response in the dialect of the requesting pipeline: HTML text for
/// pages, a structured JSON object otherwise. Internal detail stays in the
/// logs; only typed errors carry a message out.
fn dynamic_error(err: &RunletError, is_page: bool) -> ResponseEvent {
    let (status, message) = match err {
        RunletError::Http { status, message } => (*status, message.clone()),
        _ => (500, "Internal Server Error".to_string()),
    };
    let mut headers = HashMap::new();
    let body = if is_page {
        headers.insert("content-type".to_string(), "text/html".to_string());
        message.clone()
    } else {
        headers.insert("content-type".to_string(), "application/json".to_string());
        serde_json::json!({ "status": status, "message": message }).to_string()
    };
    let status_message = (!message.is_empty()).then_some(message);
    ResponseEvent {
        status_code: status,
        status_message,
        headers,
        cookies: Vec::new(),
        is_base64_encoded: false,
        body,
    }
}

/// Dynamic output must never be cached by clients or intermediaries.
fn force_uncacheable(state: &mut ResponseState) {
    state.headers.remove("last-modified");
    state.headers.remove("etag");
    state.headers.insert("cache-control".to_string(), "no-cache".to_string());
    state.headers.insert("pragma".to_string(), "no-cache".to_string());
    state.headers.insert("expires".to_string(), "-1".to_string());
}

/// Convert a response state to the outbound event, defaulting the content
/// type from the body shape and the pipeline dialect.
fn shape_response(state: ResponseState, is_page: bool) -> ResponseEvent {
    let cookies = state.serialized_cookies();
    let mut headers: HashMap<String, String> = state.headers.into_iter().collect();
    let (body, is_base64_encoded) = match state.body {
        Body::None => (String::new(), false),
        Body::Text(text) => {
            headers.entry("content-type".to_string()).or_insert_with(|| {
                if is_page { "text/html".to_string() } else { "application/json".to_string() }
            });
            (text, false)
        }
        Body::Json(json) => {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
            (json.to_string(), false)
        }
        Body::Binary(bytes) => {
            headers.entry("content-type".to_string()).or_insert_with(|| OCTET_STREAM.to_string());
            (base64::engine::general_purpose::STANDARD.encode(bytes), true)
        }
    };
    let status_message = state.message.filter(|m| !m.is_empty());
    ResponseEvent {
        status_code: state.status,
        status_message,
        headers,
        cookies,
        is_base64_encoded,
        body,
    }
}

/// Successful static response: always base64, statusMessage "ok".
fn ok_static(headers: HashMap<String, String>, bytes: &[u8]) -> ResponseEvent {
    ResponseEvent {
        status_code: 200,
        status_message: Some("ok".to_string()),
        headers,
        cookies: Vec::new(),
        is_base64_encoded: true,
        body: base64::engine::general_purpose::STANDARD.encode(bytes),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
