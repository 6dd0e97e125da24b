//! Markdown and plain-text converters.
//!
//! Markdown passes through untouched apart from normalization. Plain text
//! is restructured: paragraphs (blank-line separated) are reflowed onto one
//! line, and single-line paragraphs that look like titles become `##`
//! headings.

use super::Converter;
use crate::error::Doc2MdError;
use crate::input;
use crate::normalize::{normalize_line_endings, normalize_markdown};
use crate::output::{FormatTag, MarkdownResult, RunId};
use std::path::Path;
use tracing::info;

/// Short-line threshold as a fraction of the average line length.
const SHORT_LINE_RATIO: f64 = 0.4;

const SENTENCE_END: &[char] = &['.', '!', '?', '。', '！', '？', '…'];

/// `.md` / `.markdown` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownConverter;

impl Converter for MarkdownConverter {
    fn format(&self) -> FormatTag {
        FormatTag::Markdown
    }

    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        let text = input::read_source_text(path)?;
        let content = normalize_markdown(&text);
        info!(path = %path.display(), run_id = %run_id, content_length = content.len(), "Converted markdown file");
        Ok(MarkdownResult::new(content, path, FormatTag::Markdown, run_id.clone()))
    }
}

/// `.txt` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextConverter;

impl Converter for PlainTextConverter {
    fn format(&self) -> FormatTag {
        FormatTag::PlainText
    }

    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        let text = input::read_source_text(path)?;
        let content = normalize_markdown(&structure_text(&text));
        info!(path = %path.display(), run_id = %run_id, content_length = content.len(), "Converted text file");
        Ok(MarkdownResult::new(content, path, FormatTag::PlainText, run_id.clone()))
    }
}

/// Turn free text into Markdown paragraphs and headings.
pub fn structure_text(text: &str) -> String {
    let text = normalize_line_endings(text);
    let paragraphs = split_paragraphs(&text);

    let lengths: Vec<usize> = paragraphs
        .iter()
        .flatten()
        .map(|l| l.chars().count())
        .collect();
    if lengths.is_empty() {
        return String::new();
    }
    let avg = lengths.iter().sum::<usize>() as f64 / lengths.len() as f64;

    paragraphs
        .iter()
        .map(|lines| match lines.as_slice() {
            [single] if is_heading(single, avg) => format!("## {single}"),
            _ => lines.join(" "),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Blank-line separated groups of trimmed, non-empty lines.
fn split_paragraphs(text: &str) -> Vec<Vec<&str>> {
    let mut paragraphs = Vec::new();
    let mut current = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

fn is_heading(line: &str, avg_len: f64) -> bool {
    if is_all_upper(line) {
        return true;
    }
    let short = (line.chars().count() as f64) < avg_len * SHORT_LINE_RATIO;
    short && !line.ends_with(SENTENCE_END)
}

/// Upper-case in the sense of "has cased letters and none are lower-case".
fn is_all_upper(line: &str) -> bool {
    line.chars().count() > 1
        && line.chars().any(char::is_uppercase)
        && !line.chars().any(char::is_lowercase)
}
