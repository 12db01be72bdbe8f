//! Normalization of converter output before it leaves the request.

use std::path::Path;

use encoding_rs::{Encoding, UTF_8, UTF_16BE};
use scraper::{Html, Selector};

use crate::{ConversionError, mojibake};

/// Encoding Poppler writes for an `-enc` name.
///
/// Poppler's `UCS-2` is big-endian, while the WHATWG label of the same name
/// means little-endian. Names `encoding_rs` does not know (`ASCII7`, empty)
/// are read as UTF-8.
pub fn encoding_for(name: &str) -> &'static Encoding {
    let normalized = name.trim().to_ascii_lowercase().replace(['-', '_'], "");
    if normalized == "ucs2" {
        return UTF_16BE;
    }
    Encoding::for_label(name.trim().as_bytes()).unwrap_or(UTF_8)
}

/// Decode artifact bytes according to the encoding the tool was asked for.
/// A byte order mark, if present, wins; malformed sequences become U+FFFD.
pub fn decode(bytes: &[u8], encoding: &str) -> String {
    let (text, used, had_errors) = encoding_for(encoding).decode(bytes);
    if had_errors {
        tracing::debug!(encoding = used.name(), "artifact had undecodable bytes");
    }
    text.into_owned()
}

/// Keep the first `<title>` and the first `<meta>`, drop the rest.
///
/// Poppler emits a title and meta block per page in single-page mode.
pub fn dedupe_head_elements(html: &str) -> String {
    let mut document = Html::parse_document(html);
    let mut doomed = Vec::new();
    for selector in ["title", "meta"] {
        let selector = Selector::parse(selector).unwrap();
        doomed.extend(document.select(&selector).skip(1).map(|el| el.id()));
    }
    for id in doomed {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    document.html()
}

/// Structural de-duplication followed by mojibake repair.
pub fn normalize_html(html: &str) -> String {
    let deduped = dedupe_head_elements(html);
    mojibake::fix(&deduped).into_owned()
}

/// Load the artifact at `path` in `encoding` and normalize it.
pub fn postprocess(path: &Path, encoding: &str) -> Result<String, ConversionError> {
    let bytes = std::fs::read(path).map_err(|e| {
        ConversionError::environment(
            "postprocess",
            format!("cannot read {}: {}", path.display(), e),
        )
    })?;
    Ok(normalize_html(&decode(&bytes, encoding)))
}
