//! Vision-LLM recognition engine.
//!
//! Each page image is sent once, as a PNG attachment, with a transcription
//! system prompt. No retries: a failed call fails the page, and the caller
//! decides whether to rerun the document.
//!
//! Provider resolution, most specific first:
//!
//! 1. explicit provider name (+ optional model)
//! 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
//! 3. `OPENAI_API_KEY` present → OpenAI
//! 4. `ProviderFactory::from_env` auto-detection
//!
//! The provider is created on first use, so building a Dispatcher never
//! needs API keys.

use super::encode::encode_png;
use super::engine::{ExecutionMode, RecognitionEngine};
use super::postprocess::clean_vision_output;
use crate::error::Doc2MdError;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

/// System prompt for page transcription.
pub const TRANSCRIBE_PROMPT: &str = r#"You transcribe a single scanned page image into clean Markdown.

Rules:
- Reproduce ALL visible text in natural reading order. Do not summarise, translate or correct wording.
- Use #/##/### for headings that are visually headings, - or 1. for lists, **bold** and *italic* where the page shows emphasis.
- Render tables as GitHub pipe tables with a header separator row.
- Skip page numbers, running headers and footers, and purely decorative elements.
- Output only the Markdown. No code fences around it, no commentary."#;

/// [`RecognitionEngine`] backed by an `edgequake-llm` provider.
pub struct VisionEngine {
    provider_name: Option<String>,
    model: Option<String>,
    provider: OnceCell<Arc<dyn LLMProvider>>,
    temperature: f32,
    max_tokens: usize,
}

impl std::fmt::Debug for VisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionEngine")
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("initialised", &self.provider.get().is_some())
            .finish()
    }
}

impl VisionEngine {
    pub fn new(provider_name: Option<String>, model: Option<String>) -> Self {
        Self {
            provider_name,
            model,
            provider: OnceCell::new(),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    /// Use an already-configured provider (tests, custom middleware).
    pub fn with_provider(provider: Arc<dyn LLMProvider>) -> Self {
        let engine = Self::new(None, None);
        let _ = engine.provider.set(provider);
        engine
    }

    fn provider(&self) -> Result<&Arc<dyn LLMProvider>, Doc2MdError> {
        self.provider
            .get_or_try_init(|| resolve_provider(self.provider_name.as_deref(), self.model.as_deref()))
    }

    async fn transcribe(&self, image: &DynamicImage) -> Result<String, Doc2MdError> {
        let provider = self.provider()?;
        let messages = vec![
            ChatMessage::system(TRANSCRIBE_PROMPT),
            ChatMessage::user_with_images("", vec![encode_png(image)?]),
        ];
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let started = Instant::now();
        let response = provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| Doc2MdError::ocr_msg(format!("Vision model call failed: {e}")))?;
        debug!(
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Vision model transcribed page"
        );
        Ok(clean_vision_output(&response.content))
    }
}

impl RecognitionEngine for VisionEngine {
    fn name(&self) -> &str {
        "vision"
    }

    fn uses_local_device(&self) -> bool {
        false
    }

    /// Blocks on the async provider call. Must run on a blocking thread
    /// (the Dispatcher's `spawn_blocking` task) or outside any runtime.
    fn recognize(&self, image: &DynamicImage, _mode: ExecutionMode) -> Result<String, Doc2MdError> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(self.transcribe(image)),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Doc2MdError::ocr("Failed to create tokio runtime", e))?
                .block_on(self.transcribe(image)),
        }
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Doc2MdError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        Doc2MdError::ocr_msg(format!("Vision provider '{name}' is not configured: {e}"))
    })
}

fn resolve_provider(
    name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, Doc2MdError> {
    if let Some(name) = name {
        return create_provider(name, model.unwrap_or(DEFAULT_VISION_MODEL));
    }

    let non_empty = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
    if let (Some(prov), Some(env_model)) =
        (non_empty("EDGEQUAKE_LLM_PROVIDER"), non_empty("EDGEQUAKE_MODEL"))
    {
        return create_provider(&prov, model.unwrap_or(&env_model));
    }
    if non_empty("OPENAI_API_KEY").is_some() {
        return create_provider("openai", model.unwrap_or(DEFAULT_VISION_MODEL));
    }

    let (provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        Doc2MdError::ocr_msg(format!(
            "No vision provider could be detected. Set OPENAI_API_KEY, ANTHROPIC_API_KEY or EDGEQUAKE_LLM_PROVIDER: {e}"
        ))
    })?;
    Ok(provider)
}
