//! Recognition engines: image in, text out.
//!
//! The engine itself is a black box. [`CommandEngine`] shells out to any
//! OCR tool that can read an image file and print text (tesseract by
//! default). [`super::vision::VisionEngine`] asks a vision LLM instead.

use crate::error::Doc2MdError;
use image::{DynamicImage, ImageFormat};
use std::fmt;
use std::process::Command;
use tracing::debug;

/// Where recognition runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Gpu,
    Cpu,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Gpu => "gpu",
            ExecutionMode::Cpu => "cpu",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A text recogniser for one rasterised page or image.
pub trait RecognitionEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the execution mode matters. Engines that never touch a local
    /// device skip the capability probe entirely.
    fn uses_local_device(&self) -> bool {
        true
    }

    fn recognize(&self, image: &DynamicImage, mode: ExecutionMode) -> Result<String, Doc2MdError>;
}

/// Substrings of device-runtime failures that justify switching to CPU.
const GPU_ERROR_MARKERS: [&str; 8] = [
    "cuda",
    "cudnn",
    "cublas",
    "gpu",
    "out of memory",
    "memory alloc",
    "device-side assert",
    "driver",
];

/// Whether `err` (including its source chain) looks like a GPU runtime
/// failure.
pub fn is_gpu_runtime_error(err: &Doc2MdError) -> bool {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(s) = source {
        text.push(' ');
        text.push_str(&s.to_string());
        source = s.source();
    }
    let text = text.to_lowercase();
    GPU_ERROR_MARKERS.iter().any(|m| text.contains(m))
}

/// Runs an external OCR command per image.
///
/// The template is split on whitespace; `{input}` becomes the path of a
/// temporary PNG and `{device}` becomes `gpu` or `cpu`. The mode is also
/// exported as `DOC2MD_OCR_DEVICE_MODE`. Stdout is the recognised text; a
/// non-zero exit fails with stderr as the message.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    template: String,
}

impl CommandEngine {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn argv(&self, input: &str, mode: ExecutionMode) -> Vec<String> {
        self.template
            .split_whitespace()
            .map(|arg| {
                arg.replace("{input}", input)
                    .replace("{device}", mode.as_str())
            })
            .collect()
    }
}

impl RecognitionEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn recognize(&self, image: &DynamicImage, mode: ExecutionMode) -> Result<String, Doc2MdError> {
        let tmp = tempfile::Builder::new()
            .prefix("doc2md-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| Doc2MdError::ocr("Cannot create temporary image file", e))?;
        image
            .save_with_format(tmp.path(), ImageFormat::Png)
            .map_err(|e| Doc2MdError::ocr("Cannot write temporary image file", e))?;

        let input = tmp.path().to_string_lossy().into_owned();
        let argv = self.argv(&input, mode);
        let Some((program, args)) = argv.split_first() else {
            return Err(Doc2MdError::ocr_msg("OCR command template is empty"));
        };

        debug!(program = %program, mode = %mode, "Running OCR command");
        let output = Command::new(program)
            .args(args)
            .env("DOC2MD_OCR_DEVICE_MODE", mode.as_str())
            .output()
            .map_err(|e| Doc2MdError::ocr(format!("Cannot run OCR command '{program}'"), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Doc2MdError::ocr_msg(format!(
                "OCR command '{program}' exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
