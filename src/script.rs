//! Dynamic script execution.
//!
//! Loads script source (ready-to-run, or freshly compiled from a
//! template), evaluates it with an embedded Rhai engine, and awaits its
//! single zero-argument `handler` entry point. The engine scope is
//! restricted: scripts see nothing of the host beyond the injected global
//! surface built here, and modules import under the application base
//! directory only.
//!
//! The request snapshot and the invocation's response builder are passed
//! in explicitly, so nothing leaks between invocations on a warm process.
//! The same builder flows through every script of one invocation: state a
//! passing filter writes is inherited by the handler that runs after it.

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::RunletError;
use crate::http::MimeRegistry;
use crate::response::{Body, Cookie, CookieAttr, ResponseBuilder};

/// Name of the entry point every dynamic unit must define.
pub const ENTRY_POINT: &str = "handler";

/// Value returned by a script's entry point, reduced to the shapes the
/// dispatcher knows how to serve.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    Unit,
    Bool(bool),
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
    Other,
}

/// Result of one script execution.
#[derive(Debug)]
pub struct Execution {
    pub returned: ReturnValue,
    /// The invocation's builder, handed back with whatever the script wrote.
    pub builder: ResponseBuilder,
}

/// Execute script source and call its entry point.
///
/// `builder` is the invocation's response builder; it comes back in the
/// [`Execution`] so the dispatcher can thread it through the filter and
/// handler stages. `origin` is used in diagnostics only; it never reaches
/// a response body.
pub fn run(
    source: &str,
    origin: &Path,
    request: serde_json::Value,
    body: Option<Vec<u8>>,
    builder: ResponseBuilder,
    settings: &Arc<Settings>,
    mime: &Arc<MimeRegistry>,
) -> Result<Execution, RunletError> {
    let builder = Rc::new(RefCell::new(builder));
    let engine = build_engine(request, body, &builder, Arc::clone(settings), Arc::clone(mime));

    let ast = engine
        .compile(source)
        .map_err(|e| RunletError::Script(format!("{}: {e}", origin.display())))?;
    let mut scope = Scope::new();
    let result = engine.call_fn::<Dynamic>(&mut scope, &ast, ENTRY_POINT, ());
    let returned = match result {
        Ok(value) => convert_dynamic(value),
        Err(err) => return Err(map_eval_error(&err, origin)),
    };

    // The engine owns the remaining clones through its registered closures.
    drop(engine);
    let builder = match Rc::try_unwrap(builder) {
        Ok(cell) => cell.into_inner(),
        Err(shared) => shared.borrow().clone(),
    };
    Ok(Execution { returned, builder })
}

/// Build an engine with the fixed global surface for one execution.
fn build_engine(
    request: serde_json::Value,
    body: Option<Vec<u8>>,
    builder: &Rc<RefCell<ResponseBuilder>>,
    settings: Arc<Settings>,
    mime: Arc<MimeRegistry>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(FileModuleResolver::new_with_path(settings.base_path.clone()));

    engine.register_fn("request", move || -> Result<Dynamic, Box<EvalAltResult>> {
        let snapshot = rhai::serde::to_dynamic(&request)?;
        let Some(mut map) = snapshot.clone().try_cast::<Map>() else {
            return Ok(snapshot);
        };
        // Raw body bytes ride along as a blob; unit when there is none.
        let raw = match &body {
            Some(bytes) => Dynamic::from_blob(bytes.clone()),
            None => Dynamic::UNIT,
        };
        map.insert("body".into(), raw);
        Ok(Dynamic::from_map(map))
    });

    let b = Rc::clone(builder);
    engine.register_fn("status", move |code: i64| {
        b.borrow_mut().status(clamp_status(code));
    });
    let b = Rc::clone(builder);
    engine.register_fn("status", move |code: i64, message: &str| {
        b.borrow_mut().status_with_message(clamp_status(code), message);
    });
    let b = Rc::clone(builder);
    engine.register_fn("header", move |key: &str, value: Dynamic| {
        b.borrow_mut().header(key, value.to_string());
    });
    let b = Rc::clone(builder);
    engine.register_fn("remove_header", move |key: &str| {
        b.borrow_mut().remove_header(key);
    });
    let b = Rc::clone(builder);
    engine.register_fn("content_type", move |mime: &str| {
        b.borrow_mut().content_type(mime, None);
    });
    let b = Rc::clone(builder);
    engine.register_fn("content_type", move |mime: &str, charset: &str| {
        b.borrow_mut().content_type(mime, Some(charset));
    });
    let b = Rc::clone(builder);
    engine.register_fn("cookie", move |name: &str, value: Dynamic| {
        b.borrow_mut().cookie(name, cookie_from_dynamic(&value));
    });
    let b = Rc::clone(builder);
    engine.register_fn("body", move |value: Dynamic| {
        b.borrow_mut().body(body_from_dynamic(value));
    });
    let b = Rc::clone(builder);
    engine.register_fn("redirect", move |url: &str| {
        b.borrow_mut().redirect(url, None, None);
    });
    let b = Rc::clone(builder);
    engine.register_fn("redirect", move |url: &str, status: i64| {
        b.borrow_mut().redirect(url, None, Some(clamp_status(status)));
    });
    let b = Rc::clone(builder);
    engine.register_fn("redirect", move |url: &str, params: Map| {
        b.borrow_mut().redirect(url, Some(&map_to_params(&params)), None);
    });
    let b = Rc::clone(builder);
    engine.register_fn("redirect", move |url: &str, params: Map, status: i64| {
        b.borrow_mut()
            .redirect(url, Some(&map_to_params(&params)), Some(clamp_status(status)));
    });

    engine.register_fn("load_conf", move |name: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        match settings.load_conf(name) {
            Some(value) => rhai::serde::to_dynamic(&value),
            None => Ok(Dynamic::UNIT),
        }
    });

    let m = Arc::clone(&mime);
    engine.register_fn("mime_type", move |extension: &str| -> String {
        m.content_type(extension)
    });
    engine.register_fn("mime_entry", move |extension: &str| -> Dynamic {
        match mime.entry(extension) {
            Some(entry) => {
                let mut map = Map::new();
                map.insert("type".into(), entry.content_type.into());
                map.insert("gz".into(), entry.gzip.into());
                Dynamic::from_map(map)
            }
            None => Dynamic::UNIT,
        }
    });

    engine.register_fn("http_error", |status: i64, message: &str| -> Map {
        http_error_map(status, message)
    });
    engine.register_fn("http_error", |status: i64| -> Map {
        http_error_map(status, default_status_message(clamp_status(status)))
    });
    engine.register_fn("http_error", |status: i64, message: &str, cause: Dynamic| -> Map {
        let mut map = http_error_map(status, message);
        map.insert("cause".into(), cause);
        map
    });

    engine
}

fn http_error_map(status: i64, message: &str) -> Map {
    let mut map = Map::new();
    map.insert("status".into(), Dynamic::from(status));
    map.insert("message".into(), message.into());
    map
}

fn default_status_message(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

fn clamp_status(code: i64) -> u16 {
    u16::try_from(code).unwrap_or(500)
}

fn map_to_params(map: &Map) -> std::collections::BTreeMap<String, String> {
    map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Reduce a returned Dynamic to the dispatcher's value model.
fn convert_dynamic(value: Dynamic) -> ReturnValue {
    if value.is_unit() {
        return ReturnValue::Unit;
    }
    if value.is::<bool>() {
        return ReturnValue::Bool(value.as_bool().unwrap_or(false));
    }
    if value.is_string() {
        return ReturnValue::Text(
            value.into_immutable_string().map(|s| s.to_string()).unwrap_or_default(),
        );
    }
    if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
        return ReturnValue::Binary(blob);
    }
    if value.is_map() || value.is_array() {
        return rhai::serde::from_dynamic(&value)
            .map(ReturnValue::Json)
            .unwrap_or(ReturnValue::Other);
    }
    ReturnValue::Other
}

fn body_from_dynamic(value: Dynamic) -> Body {
    match convert_dynamic(value) {
        ReturnValue::Text(text) => Body::Text(text),
        ReturnValue::Binary(bytes) => Body::Binary(bytes),
        ReturnValue::Json(json) => Body::Json(json),
        _ => Body::None,
    }
}

/// Build a cookie from either the `"value; Attr=x; Flag"` shorthand or an
/// attribute map with a `value` key.
fn cookie_from_dynamic(value: &Dynamic) -> Cookie {
    if value.is_string() {
        let text = value.clone().into_immutable_string().unwrap_or_default();
        return Cookie::parse(&text);
    }
    if let Some(map) = value.read_lock::<Map>() {
        let mut cookie = Cookie::default();
        for (key, attr) in map.iter() {
            let key = key.trim().to_lowercase();
            if key == "value" {
                cookie.value = attr.to_string();
            } else if attr.is::<bool>() {
                if attr.as_bool().unwrap_or(false) {
                    cookie.attributes.insert(key, CookieAttr::Flag);
                }
            } else {
                cookie.attributes.insert(key, CookieAttr::Value(attr.to_string()));
            }
        }
        return cookie;
    }
    Cookie::new(value.to_string())
}

/// Map an evaluation error to the runtime taxonomy. A thrown map carrying
/// a `status` field is a typed HTTP error; everything else is opaque.
fn map_eval_error(err: &EvalAltResult, origin: &Path) -> RunletError {
    let root = unwrap_call_chain(err);
    if let EvalAltResult::ErrorRuntime(value, _) = root {
        if let Some(map) = value.read_lock::<Map>() {
            let status = map
                .get("status")
                .and_then(|d| d.as_int().ok())
                .and_then(|i| u16::try_from(i).ok());
            if let Some(status) = status {
                let message =
                    map.get("message").map(ToString::to_string).unwrap_or_default();
                return RunletError::Http { status, message };
            }
        }
    }
    RunletError::Script(format!("{}: {root}", origin.display()))
}

fn unwrap_call_chain(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => unwrap_call_chain(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn host() -> (tempfile::TempDir, Arc<Settings>, Arc<MimeRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_base(dir.path());
        let mime = Arc::new(MimeRegistry::new(settings.clone()));
        (dir, Arc::new(settings), mime)
    }

    fn exec(source: &str) -> Result<Execution, RunletError> {
        let (_dir, settings, mime) = host();
        run(
            source,
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({}),
            None,
            ResponseBuilder::new(),
            &settings,
            &mime,
        )
    }

    #[test]
    fn test_string_return() {
        let exec = exec(r#"fn handler() { "hi" }"#).unwrap();
        assert_eq!(exec.returned, ReturnValue::Text("hi".to_string()));
        assert!(!exec.builder.touched());
    }

    #[test]
    fn test_structured_return() {
        let exec = exec(r#"fn handler() { #{ ok: true, n: 3 } }"#).unwrap();
        let ReturnValue::Json(json) = exec.returned else {
            panic!("expected structured value");
        };
        assert_eq!(json["ok"], true);
        assert_eq!(json["n"], 3);
    }

    #[test]
    fn test_blob_return() {
        let exec = exec("fn handler() { blob(3, 0x41) }").unwrap();
        assert_eq!(exec.returned, ReturnValue::Binary(vec![0x41, 0x41, 0x41]));
    }

    #[test]
    fn test_response_mutators() {
        let exec = exec(
            r#"fn handler() {
                status(201, "created");
                header("x-test", "1");
                cookie("session", "abc; Secure");
                body("done");
            }"#,
        )
        .unwrap();
        assert_eq!(exec.returned, ReturnValue::Unit);
        assert!(exec.builder.touched());
        let state = exec.builder.snapshot();
        assert_eq!(state.status, 201);
        assert_eq!(state.message.as_deref(), Some("created"));
        assert_eq!(state.headers.get("x-test"), Some(&"1".to_string()));
        assert_eq!(state.body, Body::Text("done".to_string()));
        assert_eq!(
            state.serialized_cookies(),
            vec!["session=abc; secure; samesite=lax".to_string()]
        );
    }

    #[test]
    fn test_cookie_from_map() {
        let exec = exec(
            r#"fn handler() {
                cookie("s", #{ value: "v", "max-age": 60, secure: true });
            }"#,
        )
        .unwrap();
        let state = exec.builder.snapshot();
        assert_eq!(state.serialized_cookies(), vec!["s=v; max-age=60; secure; samesite=lax"]);
    }

    #[test]
    fn test_prior_builder_state_carries_through() {
        let (_dir, settings, mime) = host();
        let mut builder = ResponseBuilder::new();
        builder.cookie("audit", Cookie::new("seen"));
        let exec = run(
            r#"fn handler() { "hi" }"#,
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({}),
            None,
            builder,
            &settings,
            &mime,
        )
        .unwrap();
        assert!(exec.builder.touched());
        assert_eq!(
            exec.builder.snapshot().serialized_cookies(),
            vec!["audit=seen; samesite=lax".to_string()]
        );
    }

    #[test]
    fn test_request_body_blob() {
        let (_dir, settings, mime) = host();
        let exec = run(
            "fn handler() { request().body }",
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({"method": "POST"}),
            Some(b"raw bytes".to_vec()),
            ResponseBuilder::new(),
            &settings,
            &mime,
        )
        .unwrap();
        assert_eq!(exec.returned, ReturnValue::Binary(b"raw bytes".to_vec()));
    }

    #[test]
    fn test_request_body_absent_is_unit() {
        let exec = exec("fn handler() { request().body == () }").unwrap();
        assert_eq!(exec.returned, ReturnValue::Bool(true));
    }

    #[test]
    fn test_typed_http_error() {
        let err = exec(r#"fn handler() { throw http_error(401, "nope"); }"#).unwrap_err();
        match err {
            RunletError::Http { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "nope");
            }
            other => panic!("expected typed error, got {other:?}"),
        }
    }

    #[test]
    fn test_untyped_throw_is_opaque() {
        let err = exec(r#"fn handler() { throw "boom"; }"#).unwrap_err();
        assert!(matches!(err, RunletError::Script(_)));
    }

    #[test]
    fn test_missing_entry_point() {
        let err = exec("fn other() { 1 }").unwrap_err();
        assert!(matches!(err, RunletError::Script(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = exec("fn handler( {").unwrap_err();
        assert!(matches!(err, RunletError::Script(_)));
    }

    #[test]
    fn test_request_snapshot() {
        let (_dir, settings, mime) = host();
        let exec = run(
            "fn handler() { request().method }",
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({"method": "POST"}),
            None,
            ResponseBuilder::new(),
            &settings,
            &mime,
        )
        .unwrap();
        assert_eq!(exec.returned, ReturnValue::Text("POST".to_string()));
    }

    #[test]
    fn test_load_conf_and_mime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/app.json"), r#"{"name":"demo"}"#).unwrap();
        let settings = Settings::with_base(dir.path());
        let mime = Arc::new(MimeRegistry::new(settings.clone()));
        let settings = Arc::new(settings);

        let exec = run(
            r#"fn handler() { load_conf("app.json").name + "/" + mime_type("css") }"#,
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({}),
            None,
            ResponseBuilder::new(),
            &settings,
            &mime,
        )
        .unwrap();
        assert_eq!(exec.returned, ReturnValue::Text("demo/text/css".to_string()));

        let exec = run(
            r#"fn handler() { load_conf("missing.json") == () }"#,
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({}),
            None,
            ResponseBuilder::new(),
            &settings,
            &mime,
        )
        .unwrap();
        assert_eq!(exec.returned, ReturnValue::Bool(true));
    }

    #[test]
    fn test_module_import_under_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/util.rhai"), "fn shout(s) { s + \"!\" }").unwrap();
        let settings = Arc::new(Settings::with_base(dir.path()));
        let mime = Arc::new(MimeRegistry::new(Settings::with_base(dir.path())));

        let exec = run(
            "import \"lib/util\" as util;\nfn handler() { util::shout(\"hey\") }",
            &PathBuf::from("test.rt.rhai"),
            serde_json::json!({}),
            None,
            ResponseBuilder::new(),
            &settings,
            &mime,
        )
        .unwrap();
        assert_eq!(exec.returned, ReturnValue::Text("hey!".to_string()));
    }
}
