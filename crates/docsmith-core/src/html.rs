//! HTML presentation helpers: CSS tidying, image embedding, and HTML-to-text.

use std::path::{Component, Path};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::ConversionError;
use crate::artifact::ArtifactHandle;

static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(?:!doctype\s+html|html|head|body|title|p|div|span|table|br|h[1-6]|ul|ol|li|a|img)\b[^>]*>")
        .unwrap()
});

static RE_IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(<img\b[^>]*?\bsrc=")([^"]*)(")"#).unwrap());

static RE_FONT_NEEDS_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z-]").unwrap());

/// Whether `text` contains at least one recognisable HTML element.
///
/// Content-Type headers can be spoofed, so the `text/html` route checks
/// the payload itself.
pub fn looks_like_html(text: &str) -> bool {
    RE_HTML_TAG.is_match(text)
}

// ── CSS tidying ───────────────────────────────────────────────────────────

/// Presentation overrides accepted by the HTML-producing routes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TidyOptions {
    /// Replacement font list, e.g. `Arial, Sans Serif`.
    pub fonts: Option<String>,
    /// Replacement background colour for `div` rules.
    pub background_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum CssItem {
    Rule {
        selector: String,
        declarations: Vec<(String, String)>,
    },
    /// `@media`, `@font-face` and friends are passed through untouched.
    AtRule { prelude: String, block: String },
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_css_comments(css: &str) -> String {
    static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
    RE_COMMENT
        .replace_all(css, "")
        .replace("<!--", "")
        .replace("-->", "")
}

fn parse_declarations(block: &str) -> Vec<(String, String)> {
    block
        .split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let prop = prop.trim().to_ascii_lowercase();
            let value = collapse_ws(value);
            (!prop.is_empty() && !value.is_empty()).then_some((prop, value))
        })
        .collect()
}

fn parse_css(css: &str) -> Vec<CssItem> {
    let css = strip_css_comments(css);
    let mut items = Vec::new();
    let mut prelude = String::new();
    let mut block = String::new();
    let mut depth = 0usize;

    for c in css.chars() {
        match (c, depth) {
            ('{', 0) => depth = 1,
            ('{', _) => {
                depth += 1;
                block.push(c);
            }
            ('}', 0) => prelude.clear(),
            ('}', 1) => {
                depth = 0;
                let head = collapse_ws(&prelude);
                if head.starts_with('@') {
                    items.push(CssItem::AtRule {
                        prelude: head,
                        block: collapse_ws(&block),
                    });
                } else if !head.is_empty() {
                    items.push(CssItem::Rule {
                        selector: head,
                        declarations: parse_declarations(&block),
                    });
                }
                prelude.clear();
                block.clear();
            }
            ('}', _) => {
                depth -= 1;
                block.push(c);
            }
            (';', 0) => prelude.clear(), // bare `@import ...;`
            (_, 0) => prelude.push(c),
            (_, _) => block.push(c),
        }
    }
    items
}

fn set_declaration(declarations: &mut Vec<(String, String)>, prop: &str, value: &str) {
    match declarations.iter_mut().find(|(p, _)| p == prop) {
        Some((_, v)) => *v = value.to_string(),
        None => declarations.push((prop.to_string(), value.to_string())),
    }
}

/// Quote font family names that contain anything but letters and hyphens.
fn quote_font_families(value: &str) -> String {
    value
        .split(',')
        .map(|font| {
            let font = font
                .replace("</style>", "")
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .trim()
                .to_string();
            if RE_FONT_NEEDS_QUOTES.is_match(&font) {
                format!("\"{}\"", font.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                font
            }
        })
        .filter(|font| !font.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn minify(items: &[CssItem]) -> String {
    let mut out = String::new();
    for item in items {
        match item {
            CssItem::Rule {
                selector,
                declarations,
            } => {
                if declarations.is_empty() {
                    continue;
                }
                let body = declarations
                    .iter()
                    .map(|(p, v)| format!("{p}:{v}"))
                    .collect::<Vec<_>>()
                    .join(";");
                out.push_str(&format!("{}{{{}}}", selector.replace(", ", ","), body));
            }
            CssItem::AtRule { prelude, block } => {
                out.push_str(&format!("{prelude}{{{block}}}"));
            }
        }
    }
    out
}

/// Merge every `<style>` element into one, apply the overrides, and minify.
///
/// `div` rules always get `page-break-inside: avoid` so absolutely
/// positioned pages do not overrun each other when printed.
pub fn tidy_css(html: &str, options: &TidyOptions) -> String {
    let mut document = Html::parse_document(html);
    let selector = Selector::parse("style").unwrap();

    let mut combined = String::new();
    let mut style_ids = Vec::new();
    for style in document.select(&selector) {
        combined.extend(style.text());
        style_ids.push(style.id());
    }
    let style_count = style_ids.len();

    if style_count == 0 && (options.fonts.is_some() || options.background_color.is_some()) {
        combined.push_str("div {}");
    }

    for id in style_ids {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }

    let mut items = parse_css(&combined);
    for item in &mut items {
        let CssItem::Rule {
            selector,
            declarations,
        } = item
        else {
            continue;
        };
        let has_font = declarations.iter().any(|(p, _)| p == "font-family");
        if let Some(fonts) = &options.fonts {
            if has_font || style_count <= 1 {
                set_declaration(declarations, "font-family", fonts);
            }
        }
        if let Some((_, value)) = declarations.iter_mut().find(|(p, _)| p == "font-family") {
            *value = quote_font_families(value);
        }
        if selector.starts_with("div") {
            set_declaration(declarations, "page-break-inside", "avoid");
            if let Some(color) = &options.background_color {
                set_declaration(declarations, "background-color", color);
            }
        }
    }

    let css = minify(&items);
    let serialized = document.html();
    if css.is_empty() {
        return serialized;
    }
    serialized.replacen("</head>", &format!("<style>{css}</style></head>"), 1)
}

// ── Image embedding ───────────────────────────────────────────────────────

fn mime_for(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "svg" => "image/svg+xml".to_string(),
        "" => "application/octet-stream".to_string(),
        other => format!("image/{other}"),
    }
}

/// A `src` we may resolve against the artifact directory: relative, no
/// scheme, no parent components, and rooted in this request's namespace.
fn local_image_path<'a>(src: &'a str, handle: &ArtifactHandle) -> Option<&'a Path> {
    if src.is_empty() || src.contains(':') {
        return None;
    }
    let path = Path::new(src);
    if !path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    let first = path.components().find_map(|c| match c {
        Component::Normal(name) => Some(name),
        _ => None,
    })?;
    handle
        .owns_name(&first.to_string_lossy())
        .then_some(path)
}

/// Inline every locally produced `<img>` as a base64 data URI.
///
/// Only files of `handle`'s own namespace are read. Remote, absolute,
/// foreign and already-inlined sources are kept as they are.
pub fn embed_images(html: &str, handle: &ArtifactHandle) -> Result<String, ConversionError> {
    let mut out = String::with_capacity(html.len());
    let mut last = 0;

    for caps in RE_IMG_SRC.captures_iter(html) {
        let src_match = caps.get(2).unwrap();
        let src = src_match.as_str().replace("&amp;", "&");

        let Some(relative) = local_image_path(&src, handle) else {
            if !src.starts_with("data:") {
                tracing::debug!(src = %src, "image outside the request namespace left as is");
            }
            continue;
        };
        let path = handle.directory().join(relative);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "referenced image not produced, leaving link");
                continue;
            }
            Err(e) => {
                return Err(ConversionError::environment(
                    "embed-images",
                    format!("cannot read {}: {}", path.display(), e),
                ));
            }
        };

        out.push_str(&html[last..src_match.start()]);
        out.push_str(&format!(
            "data:{};base64,{}",
            mime_for(&path),
            STANDARD.encode(&bytes)
        ));
        last = src_match.end();
    }

    out.push_str(&html[last..]);
    Ok(out)
}

// ── HTML to text ──────────────────────────────────────────────────────────

/// Line width handed to the renderer; wide enough that paragraphs are never
/// wrapped.
const TEXT_WIDTH: usize = 10_000;

/// Render the visible text of an HTML document.
pub fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), TEXT_WIDTH)
        .trim()
        .to_string()
}
