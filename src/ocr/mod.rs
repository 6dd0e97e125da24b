//! PDF and image conversion.
//!
//! ```text
//! PDF ── count pages ── text layer meaningful? ──yes──► "## Page N" sections
//!                              │no
//!                              ▼
//!          resolve execution mode (GpuProbe) ── rasterise page ── recognise ──► sections
//!
//! image ── decode ── resolve execution mode ── recognise ──► text
//! ```
//!
//! Pages are rasterised and recognised one at a time, so at most one page
//! bitmap is alive. A GPU-mode recognition failure that looks like a device
//! runtime error switches the rest of the document to CPU. Recognised text
//! (but not a text layer) goes through the optional corrector.

pub mod correction;
pub mod encode;
pub mod engine;
pub mod pdf;
pub mod postprocess;
pub mod text_layer;
pub mod vision;

use crate::config::{ConversionConfig, DevicePreference, EnvSource, OcrEngineKind, ProcessEnv};
use crate::converters::Converter;
use crate::error::Doc2MdError;
use crate::input;
use crate::output::{FormatTag, MarkdownResult, RunId};
use crate::probe::GpuProbe;
use crate::progress::{ConversionProgressCallback, NoopProgressCallback};
use engine::{is_gpu_runtime_error, CommandEngine, ExecutionMode, RecognitionEngine};
use image::DynamicImage;
use pdf::{PdfBackend, PdfiumBackend};
use postprocess::strip_page_markers;
use std::path::Path;
use std::sync::Arc;
use text_layer::PAGE_SEPARATOR;
use tracing::{info, warn};
use vision::VisionEngine;

static NOOP_PROGRESS: NoopProgressCallback = NoopProgressCallback;

/// Shared state of the PDF and image converters.
pub struct OcrSubsystem {
    config: ConversionConfig,
    backend: Arc<dyn PdfBackend>,
    engine: Arc<dyn RecognitionEngine>,
    probe: Arc<GpuProbe>,
    env: Arc<dyn EnvSource>,
}

impl std::fmt::Debug for OcrSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrSubsystem")
            .field("engine", &self.engine.name())
            .field("device", &self.config.ocr_device)
            .finish()
    }
}

impl OcrSubsystem {
    /// pdfium backend plus the engine named by `config.ocr_engine`.
    pub fn from_config(config: &ConversionConfig, probe: Arc<GpuProbe>) -> Self {
        let engine: Arc<dyn RecognitionEngine> = match &config.ocr_engine {
            OcrEngineKind::Command { template } => Arc::new(CommandEngine::new(template.clone())),
            OcrEngineKind::Vision { provider, model } => {
                Arc::new(VisionEngine::new(provider.clone(), model.clone()))
            }
        };
        Self::with_parts(
            config.clone(),
            Arc::new(PdfiumBackend),
            engine,
            probe,
            Arc::new(ProcessEnv),
        )
    }

    pub fn with_parts(
        config: ConversionConfig,
        backend: Arc<dyn PdfBackend>,
        engine: Arc<dyn RecognitionEngine>,
        probe: Arc<GpuProbe>,
        env: Arc<dyn EnvSource>,
    ) -> Self {
        Self {
            config,
            backend,
            engine,
            probe,
            env,
        }
    }

    fn progress(&self) -> &dyn ConversionProgressCallback {
        match &self.config.progress_callback {
            Some(cb) => cb.as_ref(),
            None => &NOOP_PROGRESS,
        }
    }

    fn correct(&self, text: String, run_id: &RunId) -> String {
        correction::apply(self.config.ocr_correction.as_deref(), text, run_id.as_str())
    }

    fn finish_text(&self, text: &str) -> String {
        if self.config.strip_page_markers {
            strip_page_markers(text)
        } else {
            text.trim().to_string()
        }
    }

    /// Execution mode for this document.
    pub fn resolve_mode(&self) -> ExecutionMode {
        if !self.engine.uses_local_device() {
            return ExecutionMode::Cpu;
        }
        match self.config.ocr_device {
            DevicePreference::Cpu => ExecutionMode::Cpu,
            DevicePreference::Gpu => {
                if self.probe.is_gpu_available(false) {
                    ExecutionMode::Gpu
                } else {
                    warn!(requested = "gpu", "GPU unavailable, falling back to CPU");
                    ExecutionMode::Cpu
                }
            }
            DevicePreference::Auto => {
                if self.probe.is_gpu_available(false) {
                    ExecutionMode::Gpu
                } else {
                    ExecutionMode::Cpu
                }
            }
        }
    }

    /// Recognise one image; a GPU runtime failure downgrades `mode` to CPU
    /// and reruns the page once.
    fn recognize(&self, image: &DynamicImage, mode: &mut ExecutionMode) -> Result<String, Doc2MdError> {
        match self.engine.recognize(image, *mode) {
            Err(e) if *mode == ExecutionMode::Gpu && is_gpu_runtime_error(&e) => {
                warn!(error = %e, engine = self.engine.name(), "GPU recognition failed, switching to CPU");
                *mode = ExecutionMode::Cpu;
                self.engine.recognize(image, ExecutionMode::Cpu)
            }
            other => other,
        }
    }

    // ── PDF ──────────────────────────────────────────────────────────────

    pub fn convert_pdf(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        input::ensure_exists(path)?;
        let progress = self.progress();

        // ── Step 1: count pages ──
        let total = self.backend.page_count(path)?;
        if total == 0 {
            return Err(Doc2MdError::ocr_msg("PDF contains no pages"));
        }
        progress.on_conversion_start(total);

        // ── Step 2: text layer ──
        let layer = text_layer::extract(self.backend.as_ref(), path, &self.config.text_layer)
            .map(|text| self.finish_text(&text))
            .filter(|text| !text.is_empty());
        if let Some(content) = layer {
            info!(
                event = "ocr.pdf.text_layer",
                run_id = %run_id,
                pages = total,
                "PDF has text layer, using direct extraction"
            );
            progress.on_text_layer_checked(true);
            progress.on_conversion_complete(total, content.matches("## Page ").count());
            return Ok(MarkdownResult::new(content, path, FormatTag::Pdf, run_id.clone()));
        }
        progress.on_text_layer_checked(false);
        info!(
            event = "ocr.pdf.fallback_to_image",
            run_id = %run_id,
            pages = total,
            "PDF has no usable text layer, using OCR"
        );

        // ── Step 3: rasterise + recognise ──
        let mut mode = self.resolve_mode();
        let scale = self.config.effective_render_scale(self.env.as_ref());
        info!(mode = %mode, scale, engine = self.engine.name(), "Starting page recognition");

        let mut sections = Vec::with_capacity(total);
        self.backend.render_pages(
            path,
            scale,
            self.config.max_rendered_pixels,
            &mut |idx, image| {
                let page = idx + 1;
                progress.on_page_start(page, total);
                let text = match self.recognize(&image, &mut mode) {
                    Ok(text) => text,
                    Err(e) => {
                        progress.on_page_error(page, total, &e.to_string());
                        return Err(e);
                    }
                };
                let text = text.trim();
                if text.is_empty() {
                    warn!(page, run_id = %run_id, "Empty OCR result for page");
                } else {
                    info!(page, chars = text.len(), mode = %mode, "Recognised page");
                    sections.push(format!("## Page {page}\n\n{text}"));
                }
                progress.on_page_complete(page, total, text.len());
                Ok(())
            },
        )?;

        let recognised = sections.len();
        let content = self.correct(sections.join(PAGE_SEPARATOR), run_id);
        let content = self.finish_text(&content);
        if content.is_empty() {
            warn!(run_id = %run_id, "OCR produced no text from PDF");
        }
        progress.on_conversion_complete(total, recognised);
        Ok(MarkdownResult::new(content, path, FormatTag::Pdf, run_id.clone()))
    }

    // ── Image ────────────────────────────────────────────────────────────

    pub fn convert_image(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        input::ensure_exists(path)?;
        let progress = self.progress();
        progress.on_conversion_start(1);

        let image = image::open(path).map_err(|e| {
            Doc2MdError::ocr(format!("Failed to decode image '{}'", path.display()), e)
        })?;

        let mut mode = self.resolve_mode();
        progress.on_page_start(1, 1);
        let text = match self.recognize(&image, &mut mode) {
            Ok(text) => text,
            Err(e) => {
                progress.on_page_error(1, 1, &e.to_string());
                return Err(e);
            }
        };
        drop(image);

        let content = self.finish_text(&self.correct(text, run_id));
        progress.on_page_complete(1, 1, content.len());
        progress.on_conversion_complete(1, usize::from(!content.is_empty()));
        info!(run_id = %run_id, mode = %mode, chars = content.len(), "Recognised image");
        Ok(MarkdownResult::new(content, path, FormatTag::Image, run_id.clone()))
    }
}

/// [`Converter`] for `pdf`.
#[derive(Debug, Clone)]
pub struct PdfConverter(pub Arc<OcrSubsystem>);

impl Converter for PdfConverter {
    fn format(&self) -> FormatTag {
        FormatTag::Pdf
    }

    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        self.0.convert_pdf(path, run_id)
    }
}

/// [`Converter`] for `image`.
#[derive(Debug, Clone)]
pub struct ImageConverter(pub Arc<OcrSubsystem>);

impl Converter for ImageConverter {
    fn format(&self) -> FormatTag {
        FormatTag::Image
    }

    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        self.0.convert_image(path, run_id)
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory stand-ins for pdfium and the recognition engine.

    use super::*;
    use std::sync::Mutex;

    /// A "PDF" described by its per-page text layer.
    pub struct FakePdf {
        pub pages: Vec<String>,
        pub text_layer_error: bool,
        pub rendered: Mutex<Vec<usize>>,
    }

    impl FakePdf {
        pub fn new(pages: &[&str]) -> Self {
            Self {
                pages: pages.iter().map(|p| p.to_string()).collect(),
                text_layer_error: false,
                rendered: Mutex::new(Vec::new()),
            }
        }
    }

    impl PdfBackend for FakePdf {
        fn page_count(&self, _path: &Path) -> Result<usize, Doc2MdError> {
            Ok(self.pages.len())
        }

        fn page_texts(&self, _path: &Path) -> Result<Vec<String>, Doc2MdError> {
            if self.text_layer_error {
                return Err(Doc2MdError::ocr_msg("text extraction blew up"));
            }
            Ok(self.pages.clone())
        }

        fn render_pages(
            &self,
            _path: &Path,
            _scale: f32,
            _max_pixels: u32,
            sink: &mut pdf::PageSink<'_>,
        ) -> Result<(), Doc2MdError> {
            for idx in 0..self.pages.len() {
                self.rendered.lock().unwrap().push(idx);
                // Encode the page number in the width so the engine can tell pages apart.
                sink(idx, DynamicImage::new_rgb8(idx as u32 + 1, 1))?;
            }
            Ok(())
        }
    }

    /// Returns scripted text per page (keyed by image width) and records
    /// the execution mode of every call.
    pub struct ScriptedEngine {
        pub replies: Vec<Result<String, String>>,
        pub gpu_failure: Option<String>,
        pub modes: Mutex<Vec<ExecutionMode>>,
    }

    impl ScriptedEngine {
        pub fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| Ok(r.to_string())).collect(),
                gpu_failure: None,
                modes: Mutex::new(Vec::new()),
            }
        }
    }

    impl RecognitionEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn recognize(&self, image: &DynamicImage, mode: ExecutionMode) -> Result<String, Doc2MdError> {
            self.modes.lock().unwrap().push(mode);
            if mode == ExecutionMode::Gpu {
                if let Some(msg) = &self.gpu_failure {
                    return Err(Doc2MdError::ocr_msg(msg.clone()));
                }
            }
            let idx = image.width() as usize - 1;
            match self.replies.get(idx) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(msg)) => Err(Doc2MdError::ocr_msg(msg.clone())),
                None => Ok(String::new()),
            }
        }
    }

    pub fn probe(gpu: bool) -> Arc<GpuProbe> {
        Arc::new(GpuProbe::with_parts(
            Arc::new(std::collections::HashMap::<String, String>::new()),
            Arc::new(move |_: &dyn EnvSource| gpu),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::progress::ConversionProgressCallback;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn subsystem(
        config: ConversionConfig,
        pdf: Arc<FakePdf>,
        engine: Arc<ScriptedEngine>,
        gpu: bool,
    ) -> OcrSubsystem {
        OcrSubsystem::with_parts(
            config,
            pdf,
            engine,
            probe(gpu),
            Arc::new(HashMap::<String, String>::new()),
        )
    }

    fn dummy_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.7 stand-in").unwrap();
        (dir, path)
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl ConversionProgressCallback for Events {
        fn on_text_layer_checked(&self, accepted: bool) {
            self.0.lock().unwrap().push(format!("layer:{accepted}"));
        }
        fn on_page_complete(&self, page: usize, total: usize, _chars: usize) {
            self.0.lock().unwrap().push(format!("page:{page}/{total}"));
        }
        fn on_page_error(&self, page: usize, _total: usize, _error: &str) {
            self.0.lock().unwrap().push(format!("error:{page}"));
        }
    }

    #[test]
    fn meaningful_text_layer_skips_rasterisation() {
        let (_d, path) = dummy_file();
        let pdf = Arc::new(FakePdf::new(&[
            "Chapter one introduces the topic.\n\nPage 1",
            "",
            "Chapter three closes it.",
        ]));
        let engine = Arc::new(ScriptedEngine::new(&[]));
        let ocr = subsystem(ConversionConfig::default(), pdf.clone(), engine.clone(), false);

        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(
            r.content,
            "## Page 1\n\nChapter one introduces the topic.\n\n---\n\n## Page 3\n\nChapter three closes it.\n"
        );
        assert_eq!(r.source_format, FormatTag::Pdf);
        assert!(pdf.rendered.lock().unwrap().is_empty());
        assert!(engine.modes.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_text_layer_routes_through_recognition() {
        let (_d, path) = dummy_file();
        let pdf = Arc::new(FakePdf::new(&["", " ", ""]));
        let engine = Arc::new(ScriptedEngine::new(&["scan one", "", "scan three\n2 / 3"]));
        let events = Arc::new(Events::default());
        let config = ConversionConfig::builder()
            .ocr_device(DevicePreference::Cpu)
            .progress_callback(events.clone())
            .build()
            .unwrap();
        let ocr = subsystem(config, pdf.clone(), engine.clone(), true);

        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(
            r.content,
            "## Page 1\n\nscan one\n\n---\n\n## Page 3\n\nscan three\n"
        );
        assert_eq!(*pdf.rendered.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*engine.modes.lock().unwrap(), vec![ExecutionMode::Cpu; 3]);
        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["layer:false", "page:1/3", "page:2/3", "page:3/3"]
        );
    }

    #[test]
    fn garbage_text_layer_is_rejected() {
        let (_d, path) = dummy_file();
        let pdf = Arc::new(FakePdf::new(&["~~~ ## ..", "--- ** ::"]));
        let engine = Arc::new(ScriptedEngine::new(&["real words", "more words"]));
        let ocr = subsystem(ConversionConfig::default(), pdf.clone(), engine, false);
        ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(pdf.rendered.lock().unwrap().len(), 2);
    }

    #[test]
    fn text_layer_error_falls_back() {
        let (_d, path) = dummy_file();
        let mut fake = FakePdf::new(&["A perfectly fine text layer here."]);
        fake.text_layer_error = true;
        let pdf = Arc::new(fake);
        let engine = Arc::new(ScriptedEngine::new(&["from ocr"]));
        let ocr = subsystem(ConversionConfig::default(), pdf, engine, false);
        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(r.content, "## Page 1\n\nfrom ocr\n");
    }

    #[test]
    fn zero_pages_is_ocr_failed() {
        let (_d, path) = dummy_file();
        let ocr = subsystem(
            ConversionConfig::default(),
            Arc::new(FakePdf::new(&[])),
            Arc::new(ScriptedEngine::new(&[])),
            false,
        );
        let err = ocr.convert_pdf(&path, &RunId::from("r")).unwrap_err();
        assert!(matches!(err, Doc2MdError::OcrFailed { .. }));
        assert!(err.to_string().contains("no pages"));
    }

    #[test]
    fn recognition_failure_fails_document_and_reports_page() {
        let (_d, path) = dummy_file();
        let mut engine = ScriptedEngine::new(&["ok"]);
        engine.replies.push(Err("engine crashed".into()));
        let events = Arc::new(Events::default());
        let config = ConversionConfig::builder()
            .progress_callback(events.clone())
            .build()
            .unwrap();
        let ocr = subsystem(config, Arc::new(FakePdf::new(&["", ""])), Arc::new(engine), false);
        let err = ocr.convert_pdf(&path, &RunId::from("r")).unwrap_err();
        assert!(err.to_string().contains("engine crashed"));
        assert!(events.0.lock().unwrap().contains(&"error:2".to_string()));
    }

    #[test]
    fn gpu_runtime_error_degrades_rest_of_document_to_cpu() {
        let (_d, path) = dummy_file();
        let mut engine = ScriptedEngine::new(&["one", "two", "three"]);
        engine.gpu_failure = Some("CUDA error: out of memory".into());
        let engine = Arc::new(engine);
        let ocr = subsystem(
            ConversionConfig::default(),
            Arc::new(FakePdf::new(&["", "", ""])),
            engine.clone(),
            true,
        );
        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert!(r.content.contains("three"));
        use ExecutionMode::*;
        assert_eq!(*engine.modes.lock().unwrap(), vec![Gpu, Cpu, Cpu, Cpu]);
    }

    #[test]
    fn non_gpu_error_in_gpu_mode_is_not_retried() {
        let (_d, path) = dummy_file();
        let mut engine = ScriptedEngine::new(&[]);
        engine.gpu_failure = Some("unsupported image layout".into());
        let engine = Arc::new(engine);
        let ocr = subsystem(
            ConversionConfig::default(),
            Arc::new(FakePdf::new(&[""])),
            engine.clone(),
            true,
        );
        assert!(ocr.convert_pdf(&path, &RunId::from("r")).is_err());
        assert_eq!(engine.modes.lock().unwrap().len(), 1);
    }

    #[test]
    fn device_preference_resolution() {
        let engine = Arc::new(ScriptedEngine::new(&[]));
        let pdf = Arc::new(FakePdf::new(&[]));
        let with = |device, gpu| {
            let config = ConversionConfig::builder().ocr_device(device).build().unwrap();
            subsystem(config, pdf.clone(), engine.clone(), gpu).resolve_mode()
        };
        assert_eq!(with(DevicePreference::Auto, true), ExecutionMode::Gpu);
        assert_eq!(with(DevicePreference::Auto, false), ExecutionMode::Cpu);
        assert_eq!(with(DevicePreference::Gpu, false), ExecutionMode::Cpu);
        assert_eq!(with(DevicePreference::Gpu, true), ExecutionMode::Gpu);
        assert_eq!(with(DevicePreference::Cpu, true), ExecutionMode::Cpu);
    }

    fn shouting() -> correction::OcrCorrection {
        Arc::new(|t: &str| -> Result<String, crate::error::BoxError> { Ok(t.to_uppercase()) })
    }

    #[test]
    fn corrector_rewrites_recognised_pages() {
        let (_d, path) = dummy_file();
        let config = ConversionConfig::builder()
            .ocr_correction(shouting())
            .build()
            .unwrap();
        let engine = Arc::new(ScriptedEngine::new(&["teh scan", "page two"]));
        let ocr = subsystem(config, Arc::new(FakePdf::new(&["", ""])), engine, false);
        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(r.content, "## PAGE 1\n\nTEH SCAN\n\n---\n\n## PAGE 2\n\nPAGE TWO\n");
    }

    #[test]
    fn corrector_is_skipped_for_text_layer() {
        let (_d, path) = dummy_file();
        let config = ConversionConfig::builder()
            .ocr_correction(shouting())
            .build()
            .unwrap();
        let pdf = Arc::new(FakePdf::new(&["A perfectly readable text layer."]));
        let ocr = subsystem(config, pdf, Arc::new(ScriptedEngine::new(&[])), false);
        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(r.content, "## Page 1\n\nA perfectly readable text layer.\n");
    }

    #[test]
    fn failing_corrector_keeps_recognised_text() {
        let (_d, path) = dummy_file();
        let broken: correction::OcrCorrection =
            Arc::new(|_: &str| -> Result<String, crate::error::BoxError> { Err("llm timeout".into()) });
        let config = ConversionConfig::builder()
            .ocr_correction(broken)
            .build()
            .unwrap();
        let engine = Arc::new(ScriptedEngine::new(&["raw scan"]));
        let ocr = subsystem(config, Arc::new(FakePdf::new(&[""])), engine, false);
        let r = ocr.convert_pdf(&path, &RunId::from("r")).unwrap();
        assert_eq!(r.content, "## Page 1\n\nraw scan\n");
    }

    #[test]
    fn corrector_applies_to_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.png");
        DynamicImage::new_rgb8(1, 1).save(&path).unwrap();
        let config = ConversionConfig::builder()
            .ocr_correction(shouting())
            .build()
            .unwrap();
        let engine = Arc::new(ScriptedEngine::new(&["milk eggs"]));
        let ocr = subsystem(config, Arc::new(FakePdf::new(&[])), engine, false);
        let r = ocr.convert_image(&path, &RunId::from("img")).unwrap();
        assert_eq!(r.content, "MILK EGGS\n");
    }

    #[test]
    fn image_conversion_strips_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        DynamicImage::new_rgb8(1, 1).save(&path).unwrap();
        let engine = Arc::new(ScriptedEngine::new(&["Receipt total 42\n第 1 页"]));
        let ocr = subsystem(
            ConversionConfig::default(),
            Arc::new(FakePdf::new(&[])),
            engine,
            false,
        );
        let r = ocr.convert_image(&path, &RunId::from("img")).unwrap();
        assert_eq!(r.content, "Receipt total 42\n");
        assert_eq!(r.source_format, FormatTag::Image);
    }

    #[test]
    fn undecodable_image_is_ocr_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let ocr = subsystem(
            ConversionConfig::default(),
            Arc::new(FakePdf::new(&[])),
            Arc::new(ScriptedEngine::new(&[])),
            false,
        );
        let err = ocr.convert_image(&path, &RunId::from("r")).unwrap_err();
        assert!(matches!(err, Doc2MdError::OcrFailed { source: Some(_), .. }));
    }
}
