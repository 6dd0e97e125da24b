//! Text normalization shared by every converter.
//!
//! Two concerns live here:
//!
//! * **Decoding** ([`decode_text`]): turn raw bytes into a `String` without
//!   assuming a locale. BOM first, then strict UTF-8, then a BOM-less UTF-16
//!   check, then the legacy CJK encodings scored by how much of the decoded
//!   text lands in CJK script ranges, and finally windows-1252 (which cannot
//!   fail). Data containing NUL bytes that is not UTF-16 is treated as binary.
//!
//! * **Layout** ([`normalize_markdown`]): CRLF/CR → LF, trailing whitespace
//!   stripped per line, exactly one trailing newline.

use crate::error::Doc2MdError;
use encoding_rs::{Encoding, BIG5, EUC_KR, GB18030, SHIFT_JIS, UTF_16BE, UTF_16LE, WINDOWS_1252};
use std::path::Path;
use tracing::debug;

/// Legacy multi-byte encodings tried, in tie-break order.
const LEGACY_CJK: [&Encoding; 4] = [GB18030, SHIFT_JIS, EUC_KR, BIG5];

/// Share of non-ASCII characters that must be CJK for a legacy match.
const CJK_ACCEPT_RATIO: f32 = 0.8;

/// Decode `bytes` to text, detecting the encoding heuristically.
pub fn decode_text(bytes: &[u8], path: &Path) -> Result<String, Doc2MdError> {
    // ── Step 1: explicit BOM ──────────────────────────────────────────────
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        debug!(path = %path.display(), encoding = encoding.name(), "BOM detected");
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return Ok(text.into_owned());
    }

    // ── Step 2: strict UTF-8 ──────────────────────────────────────────────
    if let Ok(text) = std::str::from_utf8(bytes) {
        if !text.contains('\0') {
            return Ok(text.to_string());
        }
    }

    // ── Step 3: BOM-less UTF-16 ───────────────────────────────────────────
    if let Some(encoding) = sniff_utf16(bytes) {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            debug!(path = %path.display(), encoding = encoding.name(), "UTF-16 without BOM");
            return Ok(text.into_owned());
        }
    }

    if bytes.contains(&0) {
        return Err(Doc2MdError::EncodingDetectionFailed {
            path: path.to_path_buf(),
            detail: "content contains NUL bytes and is not UTF-16; looks binary".into(),
        });
    }

    // ── Step 4: legacy CJK encodings ──────────────────────────────────────
    let mut best: Option<(&'static Encoding, f32, String)> = None;
    for encoding in LEGACY_CJK {
        let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes)
        else {
            continue;
        };
        let ratio = cjk_ratio(&text);
        if ratio >= CJK_ACCEPT_RATIO && best.as_ref().is_none_or(|(_, r, _)| ratio > *r) {
            best = Some((encoding, ratio, text.into_owned()));
        }
    }
    if let Some((encoding, ratio, text)) = best {
        debug!(path = %path.display(), encoding = encoding.name(), ratio, "Legacy CJK encoding selected");
        return Ok(text);
    }

    // ── Step 5: single-byte fallback ──────────────────────────────────────
    let (text, _, _) = WINDOWS_1252.decode(bytes);
    debug!(path = %path.display(), "Falling back to windows-1252");
    Ok(text.into_owned())
}

/// Guess UTF-16 byte order from the position of zero bytes.
///
/// Mostly-ASCII UTF-16 text has a zero in every other byte; require that in
/// at least 30% of code units before trusting it.
fn sniff_utf16(bytes: &[u8]) -> Option<&'static Encoding> {
    if bytes.len() < 4 || bytes.len() % 2 != 0 {
        return None;
    }
    let units = bytes.len() / 2;
    let (mut even_zero, mut odd_zero) = (0usize, 0usize);
    for pair in bytes.chunks_exact(2) {
        if pair[0] == 0 && pair[1] != 0 {
            even_zero += 1;
        } else if pair[1] == 0 && pair[0] != 0 {
            odd_zero += 1;
        }
    }
    let threshold = units * 3 / 10;
    if odd_zero > threshold && odd_zero > even_zero {
        Some(UTF_16LE)
    } else if even_zero > threshold && even_zero > odd_zero {
        Some(UTF_16BE)
    } else {
        None
    }
}

fn cjk_ratio(text: &str) -> f32 {
    let mut non_ascii = 0usize;
    let mut cjk = 0usize;
    for c in text.chars().filter(|c| !c.is_ascii()) {
        non_ascii += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    if non_ascii == 0 {
        return 0.0;
    }
    cjk as f32 / non_ascii as f32
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F      // CJK punctuation
        | 0x3040..=0x30FF    // kana
        | 0x3400..=0x4DBF    // ext A
        | 0x4E00..=0x9FFF    // unified ideographs
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0x1100..=0x11FF    // hangul jamo
        | 0xF900..=0xFAFF    // compatibility ideographs
        | 0xFF00..=0xFFEF    // full/half-width forms
    )
}

// ── Layout rules ─────────────────────────────────────────────────────────

/// Apply every layout rule: line endings, trailing whitespace, final newline.
pub fn normalize_markdown(input: &str) -> String {
    let s = strip_leading_bom(input);
    let s = normalize_line_endings(s);
    let s = trim_trailing_whitespace(&s);
    ensure_final_newline(&s)
}

fn strip_leading_bom(input: &str) -> &str {
    input.strip_prefix('\u{FEFF}').unwrap_or(input)
}

pub fn normalize_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Exactly one trailing `\n`; an all-whitespace input becomes `"\n"`.
pub fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}
