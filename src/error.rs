//! Error types for the edgequake-doc2md library.
//!
//! Two layers:
//!
//! * [`Doc2MdError`]: the closed failure taxonomy every converter and the
//!   OCR subsystem speak. Variants carry the original cause (if any) as a
//!   boxed `source` so `std::error::Error::source` chains stay intact.
//!
//! * [`ConvertFailure`]: what the Dispatcher hands back to callers. It pins
//!   a [`Doc2MdError`] to the [`RunId`] of the failed invocation and renders
//!   the caller-facing [`ErrorPayload`] (`{code, message, runId}`).
//!
//! Cache read/write problems never appear here; the cache absorbs them.

use crate::output::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed underlying cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All typed conversion failures.
#[derive(Debug, Error)]
pub enum Doc2MdError {
    // ── Detection / routing ───────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{}'", .path.display())]
    FileNotFound { path: PathBuf },

    /// Neither the MIME probe nor the extension maps to a known format.
    #[error("Unsupported file type: {extension} ('{}')", .path.display())]
    UnsupportedType { path: PathBuf, extension: String },

    // ── Converter failures ────────────────────────────────────────────────
    /// A parser or converter failed; `source` keeps the original error and
    /// its text is appended to the message.
    #[error("Conversion failed: {message}{}", cause_suffix(.source))]
    ConversionFailed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Rasterisation or recognition failed.
    #[error("OCR failed: {message}{}", cause_suffix(.source))]
    OcrFailed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Bytes could not be decoded as text in any supported encoding.
    #[error("Encoding detection failed for '{}': {detail}", .path.display())]
    EncodingDetectionFailed { path: PathBuf, detail: String },
}

fn cause_suffix(source: &Option<BoxError>) -> String {
    match source {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl Doc2MdError {
    /// `ConversionFailed` with an underlying cause.
    pub fn conversion(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Doc2MdError::ConversionFailed {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// `ConversionFailed` without a cause.
    pub fn conversion_msg(message: impl Into<String>) -> Self {
        Doc2MdError::ConversionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// `OcrFailed` with an underlying cause.
    pub fn ocr(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Doc2MdError::OcrFailed {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// `OcrFailed` without a cause.
    pub fn ocr_msg(message: impl Into<String>) -> Self {
        Doc2MdError::OcrFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Doc2MdError::FileNotFound { .. } => ErrorCode::FileNotFound,
            Doc2MdError::UnsupportedType { .. } => ErrorCode::FileTypeUnsupported,
            Doc2MdError::ConversionFailed { .. } => ErrorCode::ConvertFailed,
            Doc2MdError::OcrFailed { .. } => ErrorCode::OcrFailed,
            Doc2MdError::EncodingDetectionFailed { .. } => ErrorCode::EncodingDetectionFailed,
        }
    }
}

/// Machine-readable error codes exposed in [`ErrorPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_FILE_NOT_FOUND")]
    FileNotFound,
    #[serde(rename = "E_FILE_TYPE_UNSUPPORTED")]
    FileTypeUnsupported,
    #[serde(rename = "E_CONVERT_FAILED")]
    ConvertFailed,
    #[serde(rename = "E_OCR_FAILED")]
    OcrFailed,
    #[serde(rename = "E_ENCODING_DETECTION_FAILED")]
    EncodingDetectionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "E_FILE_NOT_FOUND",
            ErrorCode::FileTypeUnsupported => "E_FILE_TYPE_UNSUPPORTED",
            ErrorCode::ConvertFailed => "E_CONVERT_FAILED",
            ErrorCode::OcrFailed => "E_OCR_FAILED",
            ErrorCode::EncodingDetectionFailed => "E_ENCODING_DETECTION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing error shape: `{code, message, runId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub run_id: String,
}

/// A failed conversion, tagged with the run that attempted it.
#[derive(Debug, Error)]
#[error("[{}] {error}", .error.code())]
pub struct ConvertFailure {
    pub run_id: RunId,
    #[source]
    pub error: Doc2MdError,
}

impl ConvertFailure {
    pub fn new(run_id: RunId, error: Doc2MdError) -> Self {
        Self { run_id, error }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }

    /// Render the serialisable payload for callers outside the core.
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.error.to_string(),
            run_id: self.run_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn codes_match_variants() {
        let e = Doc2MdError::FileNotFound {
            path: "x.md".into(),
        };
        assert_eq!(e.code(), ErrorCode::FileNotFound);
        let e = Doc2MdError::UnsupportedType {
            path: "x.xyz".into(),
            extension: ".xyz".into(),
        };
        assert_eq!(e.code().as_str(), "E_FILE_TYPE_UNSUPPORTED");
        assert_eq!(Doc2MdError::ocr_msg("boom").code(), ErrorCode::OcrFailed);
    }

    #[test]
    fn conversion_failed_preserves_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad zip header");
        let e = Doc2MdError::conversion("Failed to open docx", io);
        let cause = e.source().expect("source kept");
        assert!(cause.to_string().contains("bad zip header"));
        assert_eq!(e.to_string(), "Conversion failed: Failed to open docx: bad zip header");
    }

    #[test]
    fn payload_message_carries_the_cause() {
        let f = ConvertFailure::new(
            "run-2".into(),
            Doc2MdError::ocr("Cannot run OCR command 'tesseract'", "No such file or directory"),
        );
        assert_eq!(
            f.payload().message,
            "OCR failed: Cannot run OCR command 'tesseract': No such file or directory"
        );
        assert_eq!(Doc2MdError::ocr_msg("no pages").to_string(), "OCR failed: no pages");
    }

    #[test]
    fn payload_serializes_camel_case() {
        let f = ConvertFailure::new(
            "run-1".into(),
            Doc2MdError::FileNotFound {
                path: "missing.pdf".into(),
            },
        );
        let json = serde_json::to_value(f.payload()).unwrap();
        assert_eq!(json["code"], "E_FILE_NOT_FOUND");
        assert_eq!(json["runId"], "run-1");
        assert!(json["message"].as_str().unwrap().contains("missing.pdf"));
    }

    #[test]
    fn failure_display_includes_code() {
        let f = ConvertFailure::new("r".into(), Doc2MdError::conversion_msg("parser exploded"));
        let msg = f.to_string();
        assert!(msg.starts_with("[E_CONVERT_FAILED]"), "got: {msg}");
    }
}
