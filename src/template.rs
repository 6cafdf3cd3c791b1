//! Page template compiler.
//!
//! Turns a hybrid markup/script template into the Rhai dialect the script
//! executor runs, so server-rendered pages reduce to the same execution
//! path as plain scripts. Template syntax:
//!
//! - `<% ... %>`   raw statement, inserted verbatim (full control flow)
//! - `<%= ... %>`  expression, emitted into the output
//! - `<%# ... %>`  comment, produces nothing
//! - `${ ... }`    shorthand for `<%= ... %>`, intended for variables
//!
//! Compilation is a deterministic, pure transform in two passes: shorthand
//! braces normalize to `<%= %>` tags, then tags are extracted around
//! literal runs. The output is a self-contained `fn handler()` that
//! accumulates every literal and expression into one string buffer and
//! returns it, which makes the compiled form valid executor input.

/// Suffix of a ready-to-run script.
pub const SCRIPT_SUFFIX: &str = ".rt.rhai";
/// Suffix of a template source, compiled on demand.
pub const TEMPLATE_SUFFIX: &str = ".rt.html";
/// Suffix of a template already compiled to the script dialect.
pub const COMPILED_SUFFIX: &str = ".rhtml.rhai";
/// URL extension that routes to a page template.
pub const PAGE_EXTENSION: &str = "rhtml";

/// Output buffer variable of the generated entry point.
const OUT: &str = "rtout";

/// Whether a file name is a template source.
pub fn is_template(name: &str) -> bool {
    name.ends_with(TEMPLATE_SUFFIX)
}

/// Rewrite a template-source file name to its compiled counterpart.
/// Returns None when the name does not carry the template suffix.
pub fn compiled_name(name: &str) -> Option<String> {
    name.strip_suffix(TEMPLATE_SUFFIX)
        .map(|stem| format!("{stem}{COMPILED_SUFFIX}"))
}

/// Compile template text into executable script text.
pub fn compile(source: &str) -> String {
    let body = extract_tags(&normalize_braces(source));
    format!("fn handler() {{\nlet {OUT} = \"\";\n{body}\n{OUT}\n}}\n")
}

/// Pass A: rewrite unescaped `${ ... }` spans into `<%= ... %>` tags.
///
/// Inside a capture, a brace-depth counter and a one-character quote state
/// keep quoted `{`/`}`/`$` from affecting depth or retriggering capture.
/// `\${` emits a literal `${` with the escape consumed; an unterminated
/// `${` at end of input is emitted verbatim.
fn normalize_braces(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(source.len());
    let mut capture_start: Option<usize> = None; // index of the '$'
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false; // previous character was a backslash

    let mut i = 0;
    while i < len {
        let c = chars[i];
        if let Some(start) = capture_start {
            if let Some(q) = quote {
                if !escaped && c == q {
                    quote = None;
                }
            } else if c == '"' || c == '\'' {
                quote = Some(c);
            } else if c == '{' {
                depth += 1;
            } else if c == '}' {
                depth -= 1;
                if depth == 0 {
                    out.push_str("<%=");
                    out.extend(&chars[start + 2..i]);
                    out.push_str("%>");
                    capture_start = None;
                }
            }
        } else if c == '$' && i + 1 < len && chars[i + 1] == '{' {
            if escaped {
                // Drop the backslash already emitted and keep a literal `${`.
                out.pop();
                out.push_str("${");
                escaped = false;
                i += 2;
                continue;
            }
            capture_start = Some(i);
        } else {
            out.push(c);
        }
        escaped = c == '\\';
        i += 1;
    }
    // An unterminated `${` is emitted verbatim, not dropped.
    if let Some(start) = capture_start {
        out.extend(&chars[start..]);
    }
    out
}

/// Pass B: extract `<% %>` tags around literal runs.
///
/// Tag bodies track their own quote state so a quoted `%>` does not
/// terminate the tag. The tag body is classified by its first character:
/// `=` expression, `#` comment, anything else a raw statement.
fn extract_tags(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut out = String::new();
    let mut literal_from = 0usize; // start of the pending literal run
    let mut tag_start: Option<usize> = None; // index of the '<'
    let mut quote: Option<char> = None;
    let mut escaped = false;

    let mut i = 0;
    while i < len {
        let c = chars[i];
        if let Some(start) = tag_start {
            if let Some(q) = quote {
                if !escaped && c == q {
                    quote = None;
                }
                escaped = c == '\\';
                i += 1;
                continue;
            }
            if c == '"' || c == '\'' || c == '`' {
                quote = Some(c);
                escaped = false;
                i += 1;
                continue;
            }
            if c == '%' && i + 1 < len && chars[i + 1] == '>' {
                flush_literal(&mut out, &chars[literal_from..start]);
                literal_from = i + 2;
                push_tag(&mut out, &chars[start + 2..i]);
                tag_start = None;
                escaped = false;
                i += 2;
                continue;
            }
            i += 1;
        } else if c == '<' && i + 1 < len && chars[i + 1] == '%' {
            tag_start = Some(i);
            i += 2;
        } else {
            i += 1;
        }
    }
    // Trailing literal, including an unterminated tag left as-is.
    flush_literal(&mut out, &chars[literal_from..]);
    out
}

/// Append an emit-literal statement for a non-empty literal run.
fn flush_literal(out: &mut String, literal: &[char]) {
    if literal.is_empty() {
        return;
    }
    let text: String = literal.iter().collect();
    separate(out);
    out.push_str(OUT);
    out.push_str(" += \"");
    out.push_str(&escape_literal(&text));
    out.push_str("\";\n");
}

/// Append the statement for one tag body.
fn push_tag(out: &mut String, body: &[char]) {
    match body.first() {
        Some('=') => {
            let expr: String = body[1..].iter().collect();
            let expr = expr.trim();
            let expr = expr.strip_suffix(';').map_or(expr, str::trim_end);
            separate(out);
            out.push_str(OUT);
            out.push_str(" += (");
            out.push_str(expr);
            out.push_str(");\n");
        }
        Some('#') => {} // comment, produces nothing
        _ => {
            let statement: String = body.iter().collect();
            separate(out);
            out.push_str(statement.trim());
            out.push('\n');
        }
    }
}

fn separate(out: &mut String) {
    if !out.is_empty() {
        out.push('\n');
    }
}

/// Escape a literal run for embedding as a double-quoted string constant.
/// Backslash runs double across every escape boundary, including a
/// trailing run at segment end; newlines become `\n` escapes.
fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut backslashes = 0usize;
    for c in text.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2));
                backslashes = 0;
                out.push_str("\\\"");
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2));
                backslashes = 0;
                match c {
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out
}
