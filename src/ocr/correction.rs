//! Optional post-recognition text correction.
//!
//! A corrector sees the joined OCR text of a document (never the text layer)
//! before page markers are stripped. A failing corrector is logged and the
//! raw recognised text is kept.

use crate::error::BoxError;
use std::sync::Arc;
use tracing::warn;

/// Rewrites recognised text, e.g. with a language model.
pub trait OcrCorrector: Send + Sync {
    fn correct(&self, text: &str) -> Result<String, BoxError>;
}

impl<F> OcrCorrector for F
where
    F: Fn(&str) -> Result<String, BoxError> + Send + Sync,
{
    fn correct(&self, text: &str) -> Result<String, BoxError> {
        self(text)
    }
}

/// Shared handle stored in [`crate::config::ConversionConfig`].
pub type OcrCorrection = Arc<dyn OcrCorrector>;

/// Run `corrector` over non-blank `text`, keeping `text` on failure.
pub(crate) fn apply(corrector: Option<&dyn OcrCorrector>, text: String, run_id: &str) -> String {
    let Some(corrector) = corrector else {
        return text;
    };
    if text.trim().is_empty() {
        return text;
    }
    match corrector.correct(&text) {
        Ok(corrected) => corrected,
        Err(e) => {
            warn!(run_id, error = %e, "OCR correction failed, using raw text");
            text
        }
    }
}
