//! Cleanup of recognised text.
//!
//! Two passes, both pure `&str → String`:
//!
//! * [`strip_page_markers`]: every OCR/text-layer result. Drops lines that
//!   are nothing but a page number (`Page 3`, `p. 3`, `3 / 10`, `第 3 页`).
//! * [`clean_vision_output`]: vision-LLM output only. Undoes model habits:
//!   outer code fences, missing or duplicated table separators, invisible
//!   Unicode, placeholder image links.

use crate::normalize::{ensure_final_newline, normalize_line_endings, trim_trailing_whitespace};
use once_cell::sync::Lazy;
use regex::Regex;

// ── Page markers ─────────────────────────────────────────────────────────

static RE_MARKER_CJK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s\-—–_·.。]*第\s*\d{1,4}\s*[页頁][\s\-—–_·.。]*$").unwrap());

static RE_MARKER_PAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[\s\-—–_·.。]*(?:page|p\.?)\s*\d{1,4}[\s\-—–_·.。]*$").unwrap()
});

static RE_MARKER_FRACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\s\-—–_·.。]*(\d{1,4})\s*/\s*(\d{1,4})[\s\-—–_·.。]*$").unwrap()
});

static RE_EXTRA_BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

const MARKER_BRACKETS: &[char] = &['(', ')', '[', ']', '{', '}', '（', '）', '【', '】'];

fn marker_candidate(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(MARKER_BRACKETS, "")
}

/// Whether a whole line is only a page marker.
pub fn is_page_marker(line: &str) -> bool {
    let candidate = marker_candidate(line);
    if candidate.is_empty() {
        return false;
    }
    if RE_MARKER_CJK.is_match(&candidate) || RE_MARKER_PAGE.is_match(&candidate) {
        return true;
    }
    RE_MARKER_FRACTION
        .captures(&candidate)
        .and_then(|caps| {
            let current: u32 = caps[1].parse().ok()?;
            let total: u32 = caps[2].parse().ok()?;
            Some((1..=total).contains(&current))
        })
        .unwrap_or(false)
}

/// Remove page-marker lines and collapse the gaps they leave.
pub fn strip_page_markers(text: &str) -> String {
    let kept: Vec<&str> = text.lines().filter(|l| !is_page_marker(l)).collect();
    RE_EXTRA_BLANKS
        .replace_all(&kept.join("\n"), "\n\n")
        .trim()
        .to_string()
}

// ── Vision output ────────────────────────────────────────────────────────

/// Normalize Markdown produced by a vision model.
pub fn clean_vision_output(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = normalize_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = fix_missing_table_separator(&s);
    let s = drop_extra_table_separators(&s);
    let s = drop_placeholder_images(&s);
    let s = strip_invisible(&s);
    let s = RE_EXTRA_BLANKS.replace_all(&s, "\n\n");
    ensure_final_newline(&s)
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert `| --- |` after a header row that is directly followed by data.
fn fix_missing_table_separator(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    for (i, line) in lines.iter().enumerate() {
        out.push(line.to_string());
        let starts_table = is_table_row(line)
            && !is_separator_row(line)
            && (i == 0 || !is_table_row(lines[i - 1]));
        let next = lines.get(i + 1).copied().unwrap_or("");
        if starts_table && is_table_row(next) && !is_separator_row(next) {
            let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(cols)));
        }
    }
    out.join("\n")
}

/// Keep only the separator in second position of each table.
fn drop_extra_table_separators(input: &str) -> String {
    let mut out = Vec::new();
    let mut row_in_table = 0usize;
    for line in input.lines() {
        if is_table_row(line) {
            row_in_table += 1;
            if is_separator_row(line) && row_in_table != 2 {
                continue;
            }
        } else {
            row_in_table = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

const PLACEHOLDER_HOSTS: [&str; 5] = [
    "example.com",
    "placeholder.com",
    "dummyimage.com",
    "picsum.photos",
    "placehold.it",
];

/// Models invent image links for figures they cannot transcribe. Keep real
/// absolute URLs; turn the rest into an italic caption.
fn drop_placeholder_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            let url = caps[2].trim();
            let real = (url.starts_with("http://") || url.starts_with("https://"))
                && !PLACEHOLDER_HOSTS.iter().any(|h| url.contains(h));
            if real {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .into_owned()
}

fn strip_invisible(input: &str) -> String {
    input.replace(['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'], "")
}
