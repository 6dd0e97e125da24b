//! Embedded text-layer extraction and the meaningful-text heuristic.

use super::pdf::PdfBackend;
use crate::config::TextLayerThresholds;
use std::path::Path;
use tracing::debug;

pub(crate) const PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Whether `text` carries real content rather than stray glyphs.
///
/// Counts non-whitespace characters and, among them, alphanumerics in the
/// Unicode sense (CJK ideographs count). Both floors must be met:
/// `chars >= min_chars` and `alnum >= max(min_alnum, floor(chars * ratio))`.
pub fn is_meaningful(text: &str, t: &TextLayerThresholds) -> bool {
    let (chars, alnum) = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(n, a), c| {
            (n + 1, a + usize::from(c.is_alphanumeric()))
        });
    if chars < t.min_chars {
        return false;
    }
    let ratio_floor = (chars as f64 * f64::from(t.min_alnum_ratio)).floor() as usize;
    alnum >= t.min_alnum.max(ratio_floor)
}

/// `## Page N` sections for non-empty pages (1-based numbering, empty pages
/// keep their number but produce no section).
pub fn page_sections<'a, I>(pages: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    pages
        .into_iter()
        .enumerate()
        .filter_map(|(idx, text)| {
            let text = text.trim();
            (!text.is_empty()).then(|| format!("## Page {}\n\n{text}", idx + 1))
        })
        .collect()
}

/// Text-layer Markdown, or `None` when the layer is missing, unreadable or
/// not meaningful. Never fails: any extraction error means "no layer".
pub fn extract(
    backend: &dyn PdfBackend,
    path: &Path,
    thresholds: &TextLayerThresholds,
) -> Option<String> {
    let texts = match backend.page_texts(path) {
        Ok(texts) => texts,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Text layer extraction failed");
            return None;
        }
    };

    let sections = page_sections(texts.iter().map(String::as_str));
    if sections.is_empty() {
        debug!(path = %path.display(), "PDF has no embedded text");
        return None;
    }

    let body: String = texts.iter().map(|t| t.trim()).collect::<Vec<_>>().join("\n");
    if !is_meaningful(&body, thresholds) {
        debug!(path = %path.display(), "Embedded text below meaningful threshold");
        return None;
    }
    Some(sections.join(PAGE_SEPARATOR))
}
