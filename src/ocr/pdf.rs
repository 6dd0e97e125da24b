//! PDF access through pdfium: page counting, text-layer extraction and
//! rasterisation.
//!
//! pdfium calls are blocking and CPU-bound. Callers reach this module from
//! the Dispatcher's blocking task, never from an async worker.
//!
//! ## Handle scoping
//!
//! Each native handle (library binding → document → page → text page or
//! bitmap) lives in its own lexical scope and is dropped at the end of it,
//! which pdfium-render turns into the matching `FPDF_Close*` call. Rust drops
//! locals in reverse declaration order on every exit path (`?`, `continue`,
//! panic unwind), so release order is always the reverse of acquisition and
//! close failures never surface.

use crate::error::Doc2MdError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::debug;

/// Receives one rasterised page at a time (0-based index). Returning an
/// error stops rendering.
pub type PageSink<'a> = dyn FnMut(usize, DynamicImage) -> Result<(), Doc2MdError> + 'a;

/// Everything the OCR subsystem needs from a PDF library.
pub trait PdfBackend: Send + Sync {
    fn page_count(&self, path: &Path) -> Result<usize, Doc2MdError>;

    /// Embedded text of every page, in order. Pages without text yield "".
    fn page_texts(&self, path: &Path) -> Result<Vec<String>, Doc2MdError>;

    /// Rasterise every page at `scale` (1.0 = 72 DPI), capping both
    /// dimensions at `max_pixels`, and hand each image to `sink` before the
    /// next page is loaded.
    fn render_pages(
        &self,
        path: &Path,
        scale: f32,
        max_pixels: u32,
        sink: &mut PageSink<'_>,
    ) -> Result<(), Doc2MdError>;
}

/// [`PdfBackend`] over the pdfium shared library.
///
/// Binding order: `PDFIUM_LIB_PATH`, the working directory, then the system
/// library search path.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumBackend;

impl PdfiumBackend {
    fn bind() -> Result<Pdfium, Doc2MdError> {
        let bindings = match std::env::var("PDFIUM_LIB_PATH") {
            Ok(p) if !p.trim().is_empty() => Pdfium::bind_to_library(p.trim()),
            _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| Doc2MdError::ocr_msg(format!("pdfium library not available: {e:?}")))?;
        Ok(Pdfium::new(bindings))
    }
}

fn open_error(path: &Path, e: PdfiumError) -> Doc2MdError {
    Doc2MdError::ocr_msg(format!("Failed to open PDF '{}': {e:?}", path.display()))
}

impl PdfBackend for PdfiumBackend {
    fn page_count(&self, path: &Path) -> Result<usize, Doc2MdError> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| open_error(path, e))?;
        let count = document.pages().len() as usize;
        debug!(path = %path.display(), pages = count, "Counted PDF pages");
        Ok(count)
    }

    fn page_texts(&self, path: &Path) -> Result<Vec<String>, Doc2MdError> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| open_error(path, e))?;
        let pages = document.pages();

        let mut texts = Vec::with_capacity(pages.len() as usize);
        for idx in 0..pages.len() {
            let text = {
                let page = pages.get(idx).map_err(|e| {
                    Doc2MdError::ocr_msg(format!("Failed to load page {}: {e:?}", idx + 1))
                })?;
                let text_page = page.text().map_err(|e| {
                    Doc2MdError::ocr_msg(format!("Failed to read text of page {}: {e:?}", idx + 1))
                })?;
                text_page.all()
            };
            texts.push(text);
        }
        Ok(texts)
    }

    fn render_pages(
        &self,
        path: &Path,
        scale: f32,
        max_pixels: u32,
        sink: &mut PageSink<'_>,
    ) -> Result<(), Doc2MdError> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| open_error(path, e))?;
        let pages = document.pages();

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(scale)
            .set_maximum_width(max_pixels as i32)
            .set_maximum_height(max_pixels as i32);

        for idx in 0..pages.len() {
            let image = {
                let page = pages.get(idx).map_err(|e| {
                    Doc2MdError::ocr_msg(format!("Failed to load page {}: {e:?}", idx + 1))
                })?;
                let bitmap = page.render_with_config(&render_config).map_err(|e| {
                    Doc2MdError::ocr_msg(format!("Failed to rasterise page {}: {e:?}", idx + 1))
                })?;
                bitmap.as_image()
            };
            debug!(
                page = idx as usize + 1,
                width = image.width(),
                height = image.height(),
                "Rendered page"
            );
            sink(idx as usize, image)?;
        }
        Ok(())
    }
}
