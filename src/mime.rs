//! Content-type determination and repair for served blobs.
//!
//! Blob servers routinely mislabel files (everything as `application/json`
//! or `application/octet-stream`). For a small set of critical extensions
//! the declared type is replaced with the canonical one, but only when the
//! body itself corroborates the extension.

/// Extensions whose MIME type is corrected when the server is obviously wrong.
const CRITICAL: &[(&str, &str, &[&str])] = &[
    // extension, canonical type, allowed declared types
    ("html", "text/html", &["text/html"]),
    ("htm", "text/html", &["text/html"]),
    ("css", "text/css", &["text/css"]),
    (
        "js",
        "application/javascript",
        &["application/javascript", "text/javascript"],
    ),
    ("json", "application/json", &["application/json"]),
    ("xml", "application/xml", &["application/xml", "text/xml"]),
    ("png", "image/png", &["image/png"]),
    ("jpg", "image/jpeg", &["image/jpeg"]),
    ("jpeg", "image/jpeg", &["image/jpeg"]),
    ("gif", "image/gif", &["image/gif"]),
    ("svg", "image/svg+xml", &["image/svg+xml"]),
    (
        "ico",
        "image/x-icon",
        &["image/x-icon", "image/vnd.microsoft.icon"],
    ),
    ("woff", "font/woff", &["font/woff"]),
    ("woff2", "font/woff2", &["font/woff2"]),
    ("ttf", "font/ttf", &["font/ttf", "application/font-sfnt"]),
    (
        "eot",
        "application/vnd.ms-fontobject",
        &["application/vnd.ms-fontobject"],
    ),
];

/// Declared types that are never trusted for a critical extension.
const KNOWN_BAD: &[&str] = &[
    "application/json",
    "text/plain",
    "application/octet-stream",
    "binary/octet-stream",
];

/// Determine the content type to serve for `path` given the server-declared
/// type and the body.
pub fn resolve(path: &str, declared: Option<&str>, body: &[u8]) -> String {
    let ext = extension(path);
    let entry = ext
        .as_deref()
        .and_then(|e| CRITICAL.iter().find(|(ext, _, _)| *ext == e));
    let Some((ext, canonical, allowed)) = entry else {
        // non-critical extensions are never rewritten
        return declared
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());
    };
    let Some(declared) = declared else {
        return canonical.to_string();
    };
    let base = declared
        .split(';')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_lowercase();
    let html_mislabel = base == "text/html" && *ext != "html" && *ext != "htm";
    let suspect =
        KNOWN_BAD.contains(&base.as_str()) || html_mislabel || !allowed.contains(&base.as_str());
    if suspect && corroborates(ext, body) {
        canonical.to_string()
    } else {
        declared.to_string()
    }
}

/// Lowercased extension of the last path segment.
fn extension(path: &str) -> Option<String> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_lowercase())
    }
}

/// Does the body plausibly contain what the extension claims?
fn corroborates(ext: &str, body: &[u8]) -> bool {
    match ext {
        "html" | "htm" => looks_like_html(body),
        "css" => looks_like_css(body),
        "js" => looks_like_js(body),
        "json" => serde_json::from_slice::<serde_json::Value>(body).is_ok(),
        "xml" => text_head(body).trim_start().starts_with('<'),
        "png" => body.starts_with(b"\x89PNG\r\n\x1a\n"),
        "jpg" | "jpeg" => body.starts_with(&[0xff, 0xd8, 0xff]),
        "gif" => body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a"),
        "svg" => text_head(body).contains("<svg"),
        "ico" => body.starts_with(&[0x00, 0x00, 0x01, 0x00]),
        "woff" => body.starts_with(b"wOFF"),
        "woff2" => body.starts_with(b"wOF2"),
        "ttf" => body.starts_with(&[0x00, 0x01, 0x00, 0x00]) || body.starts_with(b"OTTO"),
        "eot" => body.len() > 35 && body[34] == 0x4c && body[35] == 0x50,
        _ => false,
    }
}

/// Lossy lowercase view of the first bytes, enough for signature checks.
fn text_head(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(512)]).to_lowercase()
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = text_head(body);
    head.contains("<!doctype html") || head.contains("<html") || head.contains("<head") || head.contains("<body")
}

fn looks_like_css(body: &[u8]) -> bool {
    let head = text_head(body);
    let has_rule = head
        .find('{')
        .and_then(|open| head[open..].find('}').map(|close| (open, close)))
        .is_some();
    has_rule && (head.contains(':') || head.contains("@media") || head.contains("@import"))
}

fn looks_like_js(body: &[u8]) -> bool {
    let head = text_head(body);
    ["function", "var ", "let ", "const ", "=>", "import ", "export ", "class "]
        .iter()
        .any(|kw| head.contains(kw))
}
