//! The Dispatcher: hash → content cache → detect → convert → write-through.
//!
//! [`Dispatcher`] owns everything that outlives a single conversion (cache
//! handle, OCR subsystem, GPU probe, metrics) and is cheap to clone. Each
//! call carries its own [`RunId`] as an argument and runs inside an
//! `info_span!("convert", run_id)`, so concurrent conversions never share
//! trace identity.
//!
//! Converters are synchronous. The async entry points move each conversion
//! onto tokio's blocking pool; [`Dispatcher::convert_blocking`] is the
//! synchronous core they all share.

use crate::cache::{content_hash, ConversionCache};
use crate::config::ConversionConfig;
use crate::converters::{Converter, DocxConverter, MarkdownConverter, PlainTextConverter, PptxConverter};
use crate::detect::detect;
use crate::error::{ConvertFailure, Doc2MdError};
use crate::input;
use crate::metrics::{ConversionMetrics, MetricsSnapshot};
use crate::ocr::{ImageConverter, OcrSubsystem, PdfConverter};
use crate::output::{FormatTag, MarkdownResult, RunId};
use crate::probe::GpuProbe;
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// Payload of a converter panic, kept as the error's source.
#[derive(Debug, Error)]
#[error("{0}")]
struct PanicMessage(String);

struct Inner {
    config: ConversionConfig,
    cache: ConversionCache,
    ocr: Arc<OcrSubsystem>,
    probe: Arc<GpuProbe>,
    metrics: ConversionMetrics,
}

/// Conversion entry point. Clones share cache, probe and metrics.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cache", &self.inner.cache)
            .field("ocr", &self.inner.ocr)
            .field("probe", &self.inner.probe)
            .finish()
    }
}

impl Dispatcher {
    /// Production wiring: on-disk cache from `config`, pdfium backend, the
    /// configured recognition engine and a process-environment GPU probe.
    pub fn new(config: ConversionConfig) -> Self {
        let probe = Arc::new(GpuProbe::new(config.probe_ttl));
        let ocr = Arc::new(OcrSubsystem::from_config(&config, Arc::clone(&probe)));
        let cache = ConversionCache::from_config(&config);
        Self::with_parts(config, cache, ocr, probe)
    }

    /// Assemble from explicit parts (tests, embedding applications).
    pub fn with_parts(
        config: ConversionConfig,
        cache: ConversionCache,
        ocr: Arc<OcrSubsystem>,
        probe: Arc<GpuProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                ocr,
                probe,
                metrics: ConversionMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ConversionCache {
        &self.inner.cache
    }

    pub fn probe(&self) -> &Arc<GpuProbe> {
        &self.inner.probe
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Recall what a previous run produced, from the run-scoped cache.
    pub fn lookup_run(&self, run_id: &RunId) -> Option<MarkdownResult> {
        self.inner.cache.lookup_run(run_id)
    }

    /// Convert on the current thread. Blocks for the whole conversion,
    /// including OCR; call from a blocking context.
    pub fn convert_blocking(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, ConvertFailure> {
        let span = info_span!("convert", run_id = %run_id, path = %path.display());
        let _entered = span.enter();

        let metrics = &self.inner.metrics;
        metrics.record_request();
        info!("Conversion started");
        let started = Instant::now();

        match self.dispatch(path, run_id) {
            Ok(result) => {
                metrics.record_success();
                info!(
                    format = %result.source_format,
                    content_length = result.content.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Conversion finished"
                );
                Ok(result)
            }
            Err(error) => {
                metrics.record_failure(error.code());
                warn!(code = %error.code(), error = %error, "Conversion failed");
                Err(ConvertFailure::new(run_id.clone(), error))
            }
        }
    }

    fn dispatch(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        let cache = &self.inner.cache;
        input::ensure_exists(path)?;

        // ── Step 1: content hash ─────────────────────────────────────────
        let hash = if cache.is_enabled() {
            match content_hash(path) {
                Ok(h) => Some(h),
                Err(e) => {
                    warn!(error = %e, "Could not hash source file, bypassing content cache");
                    None
                }
            }
        } else {
            None
        };

        // ── Step 2: content cache ────────────────────────────────────────
        if let Some(hash) = &hash {
            if let Some(hit) = cache.lookup_content(hash) {
                self.inner.metrics.record_cache_hit();
                info!(event = "cache.hit", hash = %hash, "Cache hit (file hash)");
                let result = hit.with_run_id(run_id.clone());
                cache.store_run(&result);
                return Ok(result);
            }
            self.inner.metrics.record_cache_miss();
        }

        // ── Step 3: detect ───────────────────────────────────────────────
        let format = detect(path)?;
        debug!(format = %format, "Detected format");

        // ── Step 4: convert ──────────────────────────────────────────────
        let converter = self.converter_for(format);
        let result = run_guarded(converter.as_ref(), path, run_id)?;

        // ── Step 5: write through ────────────────────────────────────────
        if let Some(hash) = &hash {
            cache.store_content(hash, &result);
        }
        cache.store_run(&result);
        Ok(result)
    }

    fn converter_for(&self, format: FormatTag) -> Box<dyn Converter> {
        match format {
            FormatTag::Markdown => Box::new(MarkdownConverter),
            FormatTag::PlainText => Box::new(PlainTextConverter),
            FormatTag::WordDocument => Box::new(DocxConverter),
            FormatTag::SlideDeck => Box::new(PptxConverter),
            FormatTag::Pdf => Box::new(PdfConverter(Arc::clone(&self.inner.ocr))),
            FormatTag::Image => Box::new(ImageConverter(Arc::clone(&self.inner.ocr))),
        }
    }

    /// Convert on the blocking pool. `run_id = None` generates a fresh one.
    pub async fn convert(
        &self,
        path: impl AsRef<Path>,
        run_id: Option<RunId>,
    ) -> Result<MarkdownResult, ConvertFailure> {
        let run_id = run_id.unwrap_or_else(RunId::generate);
        let path = path.as_ref().to_path_buf();
        let this = self.clone();
        let task_run_id = run_id.clone();

        tokio::task::spawn_blocking(move || this.convert_blocking(&path, &task_run_id))
            .await
            .map_err(|e| ConvertFailure::new(run_id, Doc2MdError::conversion("Conversion task failed", e)))?
    }

    /// Convert many files with at most `config.concurrency` in flight.
    /// Results come back in input order, each with its own run id.
    pub async fn convert_batch<I, P>(&self, paths: I) -> Vec<Result<MarkdownResult, ConvertFailure>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let jobs: Vec<PathBuf> = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        info!(files = jobs.len(), concurrency = self.inner.config.concurrency, "Starting batch");
        stream::iter(jobs)
            .map(|path| async move { self.convert(&path, None).await })
            .buffered(self.inner.config.concurrency.max(1))
            .collect()
            .await
    }

    /// Convert and write the Markdown to `output` (temp file + rename).
    pub async fn convert_to_file(
        &self,
        path: impl AsRef<Path>,
        output: impl AsRef<Path>,
        run_id: Option<RunId>,
    ) -> Result<MarkdownResult, ConvertFailure> {
        let result = self.convert(path, run_id).await?;
        write_atomic(output.as_ref(), &result.content)
            .await
            .map_err(|e| ConvertFailure::new(result.run_id.clone(), e))?;
        Ok(result)
    }
}

/// Run a converter, turning a panic into `ConversionFailed`.
fn run_guarded(
    converter: &dyn Converter,
    path: &Path,
    run_id: &RunId,
) -> Result<MarkdownResult, Doc2MdError> {
    catch_unwind(AssertUnwindSafe(|| converter.convert(path, run_id))).unwrap_or_else(|panic| {
        Err(Doc2MdError::conversion(
            format!("{} converter panicked", converter.format()),
            PanicMessage(panic_message(panic.as_ref())),
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<(), Doc2MdError> {
    let fail = |e: std::io::Error| {
        Doc2MdError::conversion(format!("Failed to write output '{}'", path.display()), e)
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, content).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;
    Ok(())
}

// ── Convenience free functions ───────────────────────────────────────────

/// Convert one file with a throwaway [`Dispatcher`].
pub async fn convert(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<MarkdownResult, ConvertFailure> {
    Dispatcher::new(config.clone()).convert(path, None).await
}

/// Convert one file and write the result to `output`.
pub async fn convert_to_file(
    path: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<MarkdownResult, ConvertFailure> {
    Dispatcher::new(config.clone())
        .convert_to_file(path, output, None)
        .await
}

/// Synchronous wrapper around [`convert`]. Builds its own runtime, so it
/// must not be called from inside one.
pub fn convert_sync(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<MarkdownResult, ConvertFailure> {
    let run_id = RunId::generate();
    let dispatcher = Dispatcher::new(config.clone());
    tokio::runtime::Runtime::new()
        .map_err(|e| {
            ConvertFailure::new(
                run_id.clone(),
                Doc2MdError::conversion("Failed to create tokio runtime", e),
            )
        })?
        .block_on(dispatcher.convert(path, Some(run_id.clone())))
}
