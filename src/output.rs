//! Output types: the normalized Markdown produced by a single conversion.
//!
//! A [`MarkdownResult`] is created exactly once per successful conversion and
//! never mutated afterwards. The one sanctioned exception is a content-cache
//! hit, where the Dispatcher hands back the stored result re-stamped with the
//! caller's current [`RunId`] via [`MarkdownResult::with_run_id`]; `content`
//! is never touched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Closed set of input formats the Detector can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    /// `.md` / `text/markdown`
    Markdown,
    /// `.txt` / `text/plain`
    #[serde(rename = "text")]
    PlainText,
    /// Office Open XML word-processing document (`.docx`).
    #[serde(rename = "docx")]
    WordDocument,
    /// Office Open XML presentation (`.pptx`).
    #[serde(rename = "pptx")]
    SlideDeck,
    /// Portable Document Format.
    Pdf,
    /// Any raster image (`image/*`).
    Image,
}

impl FormatTag {
    /// All tags, in detection-table order.
    pub const ALL: [FormatTag; 6] = [
        FormatTag::Markdown,
        FormatTag::PlainText,
        FormatTag::WordDocument,
        FormatTag::SlideDeck,
        FormatTag::Pdf,
        FormatTag::Image,
    ];

    /// Stable short name, also used in cache sidecars and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::Markdown => "markdown",
            FormatTag::PlainText => "text",
            FormatTag::WordDocument => "docx",
            FormatTag::SlideDeck => "pptx",
            FormatTag::Pdf => "pdf",
            FormatTag::Image => "image",
        }
    }

    /// Whether this format goes through the OCR subsystem.
    pub fn needs_ocr(&self) -> bool {
        matches!(self, FormatTag::Pdf | FormatTag::Image)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormatTag::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown format tag '{s}'"))
    }
}

/// Caller-scoped correlation token for one conversion invocation.
///
/// Passed explicitly through every call; never read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random run id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a cache key (`[A-Za-z0-9_-]`, non-empty).
    pub fn is_cache_safe(&self) -> bool {
        is_safe_key(&self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub(crate) fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Normalized Markdown output of a single conversion plus provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownResult {
    /// Normalized Markdown; always ends with exactly one `\n`.
    pub content: String,
    pub source_path: PathBuf,
    pub source_format: FormatTag,
    pub run_id: RunId,
}

impl MarkdownResult {
    /// Build a result, enforcing the single-trailing-newline invariant.
    pub fn new(
        content: impl Into<String>,
        source_path: impl AsRef<Path>,
        source_format: FormatTag,
        run_id: RunId,
    ) -> Self {
        Self {
            content: crate::normalize::ensure_final_newline(&content.into()),
            source_path: source_path.as_ref().to_path_buf(),
            source_format,
            run_id,
        }
    }

    /// Re-stamp a cached result with the caller's current run id.
    pub fn with_run_id(self, run_id: RunId) -> Self {
        Self { run_id, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tag_round_trips_through_str() {
        for tag in FormatTag::ALL {
            assert_eq!(tag.as_str().parse::<FormatTag>().unwrap(), tag);
        }
        assert!("xlsx".parse::<FormatTag>().is_err());
    }

    #[test]
    fn format_tag_serializes_to_short_name() {
        let json = serde_json::to_string(&FormatTag::WordDocument).unwrap();
        assert_eq!(json, "\"docx\"");
        let tag: FormatTag = serde_json::from_str("\"text\"").unwrap();
        assert_eq!(tag, FormatTag::PlainText);
    }

    #[test]
    fn result_content_gets_one_trailing_newline() {
        let r = MarkdownResult::new("# Hi\n\n\n", "a.md", FormatTag::Markdown, "r1".into());
        assert_eq!(r.content, "# Hi\n");
        let r = MarkdownResult::new("x", "a.md", FormatTag::Markdown, "r1".into());
        assert_eq!(r.content, "x\n");
    }

    #[test]
    fn with_run_id_keeps_content() {
        let r = MarkdownResult::new("body", "a.txt", FormatTag::PlainText, "old".into());
        let r2 = r.clone().with_run_id("new".into());
        assert_eq!(r2.content, r.content);
        assert_eq!(r2.run_id.as_str(), "new");
    }

    #[test]
    fn safe_keys() {
        assert!(RunId::generate().is_cache_safe());
        assert!(!RunId::from("../etc/passwd").is_cache_safe());
        assert!(!RunId::from("").is_cache_safe());
    }
}
