//! # edgequake-doc2md
//!
//! Convert Markdown, plain text, Word (`.docx`), PowerPoint (`.pptx`), PDF
//! and image files into normalized Markdown.
//!
//! ## Pipeline Overview
//!
//! ```text
//! file
//!  │
//!  ├─ 1. Hash     SHA-256 of the bytes → content-cache lookup
//!  ├─ 2. Detect   MIME guess, then extension table → FormatTag
//!  ├─ 3. Convert  text / markdown / docx / pptx converter
//!  │              pdf   → text layer, else rasterise + recognise (OCR)
//!  │              image → recognise (OCR)
//!  ├─ 4. Store    write-through to run-scoped and content caches
//!  └─ 5. Output   MarkdownResult { content, source_path, source_format, run_id }
//! ```
//!
//! OCR picks GPU or CPU from a cached [`GpuProbe`] and degrades to CPU for
//! the rest of the document when the GPU fails at runtime.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_doc2md::{ConversionConfig, Dispatcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new(ConversionConfig::from_env());
//!     let result = dispatcher.convert("slides.pptx", None).await?;
//!     println!("{}", result.content);
//!     eprintln!("run {} ({})", result.run_id, result.source_format);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2md` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! edgequake-doc2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod convert;
pub mod converters;
pub mod detect;
pub mod error;
pub mod input;
pub mod metrics;
pub mod normalize;
pub mod ocr;
pub mod output;
pub mod probe;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{content_hash, ConversionCache};
pub use config::{
    ConversionConfig, ConversionConfigBuilder, DevicePreference, EnvSource, OcrEngineKind,
    ProcessEnv, TextLayerThresholds,
};
pub use convert::{convert, convert_sync, convert_to_file, Dispatcher};
pub use detect::detect;
pub use error::{ConvertFailure, Doc2MdError, ErrorCode, ErrorPayload};
pub use metrics::{ConversionMetrics, MetricsSnapshot};
pub use ocr::correction::{OcrCorrection, OcrCorrector};
pub use output::{FormatTag, MarkdownResult, RunId};
pub use probe::GpuProbe;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{convert_stream, ConversionStream};
