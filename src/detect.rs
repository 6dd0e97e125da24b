//! Format detection: path → [`FormatTag`].
//!
//! The MIME guess is authoritative when it maps to a known tag (any `image/*`
//! type counts as an image). Only when the guess is absent or unknown does the
//! extension table get a say. Detection reads file metadata and nothing else.

use crate::error::Doc2MdError;
use crate::output::FormatTag;
use std::path::Path;
use tracing::debug;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const PPTX_MIME: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";

fn tag_for_mime(essence: &str) -> Option<FormatTag> {
    match essence {
        "text/markdown" | "text/x-markdown" => Some(FormatTag::Markdown),
        "text/plain" => Some(FormatTag::PlainText),
        DOCX_MIME => Some(FormatTag::WordDocument),
        PPTX_MIME => Some(FormatTag::SlideDeck),
        "application/pdf" => Some(FormatTag::Pdf),
        m if m.starts_with("image/") => Some(FormatTag::Image),
        _ => None,
    }
}

fn tag_for_extension(ext: &str) -> Option<FormatTag> {
    match ext {
        "md" | "markdown" => Some(FormatTag::Markdown),
        "txt" => Some(FormatTag::PlainText),
        "docx" => Some(FormatTag::WordDocument),
        "pptx" => Some(FormatTag::SlideDeck),
        "pdf" => Some(FormatTag::Pdf),
        "png" | "jpg" | "jpeg" | "bmp" | "tiff" | "tif" | "webp" => Some(FormatTag::Image),
        _ => None,
    }
}

/// Resolve the format of `path`.
///
/// # Errors
/// * `FileNotFound` when nothing exists at `path`.
/// * `UnsupportedType` when neither MIME nor extension is recognised.
pub fn detect(path: &Path) -> Result<FormatTag, Doc2MdError> {
    if !path.exists() {
        return Err(Doc2MdError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    // Primary: MIME guess.
    if let Some(mime) = mime_guess::from_path(path).first() {
        if let Some(tag) = tag_for_mime(mime.essence_str()) {
            debug!(path = %path.display(), mime = %mime, format = %tag, "Detected by MIME");
            return Ok(tag);
        }
    }

    // Fallback: extension table.
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if let Some(tag) = ext.as_deref().and_then(tag_for_extension) {
        debug!(path = %path.display(), format = %tag, "Detected by extension");
        return Ok(tag);
    }

    Err(Doc2MdError::UnsupportedType {
        path: path.to_path_buf(),
        extension: ext
            .map(|e| format!(".{e}"))
            .unwrap_or_else(|| "(no extension)".to_string()),
    })
}
