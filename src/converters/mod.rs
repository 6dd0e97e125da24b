//! Format converters.
//!
//! Every format variant implements [`Converter`]: path + run id in,
//! [`MarkdownResult`] or a typed [`Doc2MdError`] out. The Dispatcher picks
//! the implementation by matching on the detected [`FormatTag`]; there is no
//! string-keyed registry. PDFs and images go through [`crate::ocr`].

pub mod docx;
pub mod markdown;
pub mod ooxml;
pub mod pptx;
pub mod text;

use crate::error::Doc2MdError;
use crate::output::{FormatTag, MarkdownResult, RunId};
use std::path::Path;

pub use docx::DocxConverter;
pub use pptx::PptxConverter;
pub use text::{MarkdownConverter, PlainTextConverter};

/// One format's conversion contract.
///
/// Implementations are synchronous; the async entry points in
/// [`crate::convert`] run them on the blocking pool.
pub trait Converter: Send + Sync {
    /// Tag this converter produces.
    fn format(&self) -> FormatTag;

    /// Convert the file at `path`. The returned content is normalized and
    /// ends with exactly one newline.
    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError>;
}
