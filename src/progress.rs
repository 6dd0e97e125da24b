//! Progress-callback trait for OCR passes.
//!
//! Only the PDF/image route reports progress: text, Markdown and OOXML
//! conversions finish in milliseconds. Inject an
//! [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`].
//!
//! ```rust
//! use edgequake_doc2md::{ConversionConfig, ConversionProgressCallback};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl ConversionProgressCallback for Printer {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, chars: usize) {
//!         eprintln!("page {page_num}/{total_pages}: {chars} chars");
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(Printer))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Receives events while a document goes through the OCR subsystem.
///
/// Batch conversions run documents concurrently, so implementations must be
/// `Send + Sync` and guard their own state. Every method defaults to a no-op.
pub trait ConversionProgressCallback: Send + Sync {
    /// Page count is known; `total_pages` is 1 for a single image.
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// The embedded text layer was accepted (`true`) or rejected (`false`).
    fn on_text_layer_checked(&self, accepted: bool) {
        let _ = accepted;
    }

    /// Recognition is about to run for a page (1-indexed).
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// A page was recognised; `chars` is the length of its text.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, chars: usize) {
        let _ = (page_num, total_pages, chars);
    }

    /// Recognition failed for a page. The document fails with it.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// The pass finished; `pages_with_text` excludes pages that came back empty.
    fn on_conversion_complete(&self, total_pages: usize, pages_with_text: usize) {
        let _ = (total_pages, pages_with_text);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
