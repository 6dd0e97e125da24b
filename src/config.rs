//! Configuration types for document-to-Markdown conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`] or loaded from the environment with
//! [`ConversionConfig::from_env`].
//!
//! Environment values are never fatal: a malformed variable is logged at WARN
//! and the documented default is used instead. Two knobs (`render_scale`,
//! `probe_ttl`) default to `None`, meaning "read the environment at call
//! time", so a long-lived dispatcher picks up changes without a rebuild.

use crate::ocr::correction::OcrCorrection;
use crate::progress::ProgressCallback;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

// ── Environment variable names ───────────────────────────────────────────

pub const ENV_CACHE_DIR: &str = "DOC2MD_CACHE_DIR";
pub const ENV_NO_CACHE: &str = "DOC2MD_NO_CACHE";
pub const ENV_RENDER_SCALE: &str = "DOC2MD_PDF_RENDER_SCALE";
pub const ENV_TEXT_MIN_CHARS: &str = "DOC2MD_TEXT_MIN_CHARS";
pub const ENV_TEXT_MIN_ALNUM: &str = "DOC2MD_TEXT_MIN_ALNUM";
pub const ENV_TEXT_MIN_ALNUM_RATIO: &str = "DOC2MD_TEXT_MIN_ALNUM_RATIO";
pub const ENV_OCR_DEVICE: &str = "DOC2MD_OCR_DEVICE";
pub const ENV_OCR_ENGINE: &str = "DOC2MD_OCR_ENGINE";
pub const ENV_OCR_COMMAND: &str = "DOC2MD_OCR_COMMAND";
pub const ENV_PROBE_TTL: &str = "DOC2MD_GPU_PROBE_TTL_SECONDS";

/// 300 DPI against pdfium's 72 DPI baseline.
pub const DEFAULT_RENDER_SCALE: f32 = 300.0 / 72.0;
pub const DEFAULT_PROBE_TTL_SECS: u64 = 300;
pub const DEFAULT_OCR_COMMAND: &str = "tesseract {input} stdout";

/// Builder validation failure.
#[derive(Debug, Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

// ── Environment source ───────────────────────────────────────────────────

/// Read-only view of environment variables.
///
/// The process environment is the production source; tests inject maps or
/// closures so nothing depends on process-global state.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl<F> EnvSource for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn var(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Parse an env var, warning and falling back to `default` when malformed.
pub(crate) fn env_parse<T>(env: &dyn EnvSource, name: &str, default: T) -> T
where
    T: FromStr + fmt::Debug,
{
    let Some(raw) = env.var(name) else {
        return default;
    };
    let text = raw.trim();
    if text.is_empty() {
        return default;
    }
    match text.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(
                env_var = name,
                raw_value = %raw,
                default_value = ?default,
                "Invalid environment variable, falling back to default"
            );
            default
        }
    }
}

/// Truthy flag: `1`, `true`, `yes`, `on` (case-insensitive).
pub(crate) fn env_flag(env: &dyn EnvSource, name: &str) -> bool {
    env.var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

// ── Config ───────────────────────────────────────────────────────────────

/// Configuration for document conversion.
///
/// # Example
/// ```rust
/// use edgequake_doc2md::{ConversionConfig, DevicePreference};
///
/// let config = ConversionConfig::builder()
///     .cache_dir("/tmp/doc2md-cache")
///     .render_scale(2.0)
///     .ocr_device(DevicePreference::Cpu)
///     .build()
///     .unwrap();
/// assert_eq!(config.render_scale, Some(2.0));
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Root of the on-disk cache (`runs/` and `content/` live below it).
    pub cache_dir: PathBuf,

    /// Whether either cache namespace is consulted at all. Default: true.
    pub cache_enabled: bool,

    /// PDF rasterisation scale factor. `None` reads `DOC2MD_PDF_RENDER_SCALE`
    /// at call time, falling back to [`DEFAULT_RENDER_SCALE`].
    pub render_scale: Option<f32>,

    /// Cap on either rendered dimension, in pixels. Default: 6000.
    pub max_rendered_pixels: u32,

    /// Thresholds for the meaningful-text heuristic.
    pub text_layer: TextLayerThresholds,

    /// Requested recognition execution mode. Default: auto.
    pub ocr_device: DevicePreference,

    /// Recognition backend.
    pub ocr_engine: OcrEngineKind,

    /// Capability-probe TTL. `None` reads `DOC2MD_GPU_PROBE_TTL_SECONDS` on
    /// every probe call (default 300 s).
    pub probe_ttl: Option<Duration>,

    /// Drop standalone page-number lines from OCR output. Default: true.
    pub strip_page_markers: bool,

    /// Parallel conversions for batch/stream entry points. Default: 4.
    pub concurrency: usize,

    /// Optional per-page progress callback for OCR passes.
    pub progress_callback: Option<ProgressCallback>,

    /// Optional rewrite of recognised text. Never applied to a text layer.
    pub ocr_correction: Option<OcrCorrection>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_enabled: true,
            render_scale: None,
            max_rendered_pixels: 6000,
            text_layer: TextLayerThresholds::default(),
            ocr_device: DevicePreference::default(),
            ocr_engine: OcrEngineKind::default(),
            probe_ttl: None,
            strip_page_markers: true,
            concurrency: 4,
            progress_callback: None,
            ocr_correction: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("cache_dir", &self.cache_dir)
            .field("cache_enabled", &self.cache_enabled)
            .field("render_scale", &self.render_scale)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("text_layer", &self.text_layer)
            .field("ocr_device", &self.ocr_device)
            .field("ocr_engine", &self.ocr_engine)
            .field("probe_ttl", &self.probe_ttl)
            .field("strip_page_markers", &self.strip_page_markers)
            .field("concurrency", &self.concurrency)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn ConversionProgressCallback>"),
            )
            .field(
                "ocr_correction",
                &self.ocr_correction.as_ref().map(|_| "<dyn OcrCorrector>"),
            )
            .finish()
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("doc2md")
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Continue building from this configuration (e.g. env values + CLI flags).
    pub fn into_builder(self) -> ConversionConfigBuilder {
        ConversionConfigBuilder { config: self }
    }

    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(&ProcessEnv)
    }

    /// Load from an injected environment source.
    pub fn from_env_with(env: &dyn EnvSource) -> Self {
        let defaults = Self::default();

        let cache_dir = env
            .var(ENV_CACHE_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let text_layer = TextLayerThresholds {
            min_chars: env_parse(env, ENV_TEXT_MIN_CHARS, defaults.text_layer.min_chars),
            min_alnum: env_parse(env, ENV_TEXT_MIN_ALNUM, defaults.text_layer.min_alnum),
            min_alnum_ratio: env_parse(
                env,
                ENV_TEXT_MIN_ALNUM_RATIO,
                defaults.text_layer.min_alnum_ratio,
            ),
        };

        let ocr_device = match env.var(ENV_OCR_DEVICE) {
            None => DevicePreference::Auto,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(requested = %raw, "Unknown {ENV_OCR_DEVICE}, using auto mode");
                DevicePreference::Auto
            }),
        };

        Self {
            cache_dir,
            cache_enabled: !env_flag(env, ENV_NO_CACHE),
            text_layer,
            ocr_device,
            ocr_engine: OcrEngineKind::from_env_with(env),
            ..defaults
        }
    }

    /// Effective render scale for this call.
    pub fn effective_render_scale(&self, env: &dyn EnvSource) -> f32 {
        if let Some(scale) = self.render_scale {
            return scale;
        }
        let scale = env_parse(env, ENV_RENDER_SCALE, DEFAULT_RENDER_SCALE);
        if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            warn!(scale, "Non-positive render scale, using default");
            DEFAULT_RENDER_SCALE
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache_enabled = enabled;
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = Some(scale);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn text_layer(mut self, thresholds: TextLayerThresholds) -> Self {
        self.config.text_layer = thresholds;
        self
    }

    pub fn ocr_device(mut self, device: DevicePreference) -> Self {
        self.config.ocr_device = device;
        self
    }

    pub fn ocr_engine(mut self, engine: OcrEngineKind) -> Self {
        self.config.ocr_engine = engine;
        self
    }

    pub fn probe_ttl(mut self, ttl: Duration) -> Self {
        self.config.probe_ttl = Some(ttl);
        self
    }

    pub fn strip_page_markers(mut self, v: bool) -> Self {
        self.config.strip_page_markers = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    /// Attach a progress callback that fires for OCR page events.
    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Attach a corrector for OCR output (PDF fallback and images).
    pub fn ocr_correction(mut self, corrector: OcrCorrection) -> Self {
        self.config.ocr_correction = Some(corrector);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConfigError> {
        let c = &self.config;
        if let Some(scale) = c.render_scale {
            if !(scale.is_finite() && scale > 0.0 && scale <= 20.0) {
                return Err(ConfigError(format!(
                    "render scale must be in (0, 20], got {scale}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&c.text_layer.min_alnum_ratio) {
            return Err(ConfigError(format!(
                "alphanumeric ratio must be between 0 and 1, got {}",
                c.text_layer.min_alnum_ratio
            )));
        }
        if let OcrEngineKind::Command { template } = &c.ocr_engine {
            if !template.contains("{input}") {
                return Err(ConfigError(
                    "OCR command template must contain {input}".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Enums / small types ──────────────────────────────────────────────────

/// Thresholds for classifying an extracted text layer as meaningful.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextLayerThresholds {
    /// Minimum non-whitespace characters. Default: 10.
    pub min_chars: usize,
    /// Floor on alphanumeric characters. Default: 6.
    pub min_alnum: usize,
    /// Alphanumeric share of non-whitespace characters. Default: 0.2.
    pub min_alnum_ratio: f32,
}

impl Default for TextLayerThresholds {
    fn default() -> Self {
        Self {
            min_chars: 10,
            min_alnum: 6,
            min_alnum_ratio: 0.2,
        }
    }
}

/// Requested recognition execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use the GPU when the capability probe finds one.
    #[default]
    Auto,
    /// Prefer the GPU; degrades to CPU (with a warning) when unavailable.
    Gpu,
    Cpu,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(DevicePreference::Auto),
            "gpu" | "gpu:0" | "cuda" => Ok(DevicePreference::Gpu),
            "cpu" => Ok(DevicePreference::Cpu),
            other => Err(format!("unknown device '{other}' (expected auto, gpu or cpu)")),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Gpu => "gpu",
            DevicePreference::Cpu => "cpu",
        })
    }
}

/// Which recognition engine the OCR subsystem drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrEngineKind {
    /// External command; `{input}` is replaced by a PNG path and `{device}`
    /// by `gpu` or `cpu`. Recognised text is read from stdout.
    Command { template: String },
    /// Vision LLM through `edgequake-llm`. `None` fields fall back to
    /// provider auto-detection.
    Vision {
        provider: Option<String>,
        model: Option<String>,
    },
}

impl Default for OcrEngineKind {
    fn default() -> Self {
        OcrEngineKind::Command {
            template: DEFAULT_OCR_COMMAND.to_string(),
        }
    }
}

impl OcrEngineKind {
    fn from_env_with(env: &dyn EnvSource) -> Self {
        let kind = env.var(ENV_OCR_ENGINE).unwrap_or_default();
        match kind.trim().to_ascii_lowercase().as_str() {
            "vision" | "llm" => OcrEngineKind::Vision {
                provider: env.var("EDGEQUAKE_LLM_PROVIDER").filter(|v| !v.is_empty()),
                model: env.var("EDGEQUAKE_MODEL").filter(|v| !v.is_empty()),
            },
            "" | "command" => OcrEngineKind::Command {
                template: env
                    .var(ENV_OCR_COMMAND)
                    .filter(|v| v.contains("{input}"))
                    .unwrap_or_else(|| DEFAULT_OCR_COMMAND.to_string()),
            },
            other => {
                warn!(requested = other, "Unknown {ENV_OCR_ENGINE}, using command engine");
                OcrEngineKind::default()
            }
        }
    }
}
