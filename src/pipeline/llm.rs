//! Completion client: turn one page image into Markdown via the VLM.
//!
//! The model capability sits behind [`PageModel`] so the retry policy and
//! the controller can be exercised without a network. [`LlmPageModel`] is
//! the production implementation over an `edgequake-llm` provider.
//!
//! ## Retry Strategy
//!
//! Every failure of the underlying call is retried, up to
//! `max_attempts` attempts in total. Between attempts the client waits
//! `attempt × retry_backoff_ms` (linear): with the defaults that is
//! 500 ms → 1 s. Each attempt is bounded by `api_timeout_secs`; an expired
//! attempt counts as a failure. A page image that cannot be read is a
//! precondition failure and is reported without calling the model at all.

use crate::config::ConversionConfig;
use crate::error::{PageError, Pdf2MdError};
use crate::output::TokenUsage;
use crate::pipeline::{encode, postprocess};
use crate::prompts::{DEFAULT_SYSTEM_PROMPT, DEFAULT_USER_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Error type returned by a [`PageModel`].
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

/// One transcription request for one page.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub page_num: usize,
    pub image: ImageData,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// What the model returned for a page: text plus token counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

impl Completion {
    pub fn new(content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            content: content.into(),
            usage: TokenUsage::new(input_tokens, output_tokens),
        }
    }
}

/// The language-model capability: image + prompts in, text + usage out.
#[async_trait]
pub trait PageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError>;
}

/// [`PageModel`] backed by an `edgequake-llm` provider.
pub struct LlmPageModel {
    provider: Arc<dyn LLMProvider>,
}

impl LlmPageModel {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl PageModel for LlmPageModel {
    /// ## Message Layout
    ///
    /// 1. **System message**: the transcription instructions
    /// 2. **User message**: the user prompt with the page image attached
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let messages = vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user_with_images(
                request.user_prompt.as_str(),
                vec![request.image.clone()],
            ),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| -> ModelError { e.to_string().into() })?;

        Ok(Completion::new(
            response.content,
            response.prompt_tokens as u64,
            response.completion_tokens as u64,
        ))
    }
}

/// A successfully transcribed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcription {
    /// Cleaned Markdown for the page.
    pub markdown: String,
    pub usage: TokenUsage,
    /// Retries beyond the first attempt.
    pub retries: u32,
    pub duration_ms: u64,
}

/// Retrying client for single-page conversions.
///
/// Holds no mutable state; one client is shared by every conversion unit of
/// a run and by regeneration.
pub struct CompletionClient {
    model: Arc<dyn PageModel>,
    system_prompt: String,
    user_prompt: String,
    temperature: f32,
    max_tokens: usize,
    max_attempts: u32,
    config: ConversionConfig,
}

impl CompletionClient {
    pub fn new(model: Arc<dyn PageModel>, config: &ConversionConfig) -> Self {
        Self {
            model,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            user_prompt: config
                .user_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_attempts: config.max_attempts.max(1),
            config: config.clone(),
        }
    }

    /// Client over the provider resolved from `config`.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, Pdf2MdError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(Arc::new(LlmPageModel::new(provider)), config))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Transcribe the page image at `image_path`.
    ///
    /// Returns the final attempt's error as [`PageError::LlmFailed`] once
    /// every attempt has failed.
    pub async fn convert(&self, page_num: usize, image_path: &Path) -> Result<Transcription, PageError> {
        let start = Instant::now();
        let image = encode::encode_image_file(page_num, image_path).await?;

        let request = CompletionRequest {
            page_num,
            image,
            system_prompt: self.system_prompt.clone(),
            user_prompt: self.user_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let per_attempt = self.config.api_timeout();

        let mut last_err = String::from("Unknown error");
        for attempt in 1..=self.max_attempts {
            let outcome = match timeout(per_attempt, self.model.complete(&request)).await {
                Ok(Ok(completion)) => Ok(completion),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}s", per_attempt.as_secs())),
            };

            match outcome {
                Ok(completion) => {
                    let duration = start.elapsed();
                    debug!(
                        "Page {}: {} input tokens, {} output tokens, {:?}",
                        page_num,
                        completion.usage.input_tokens,
                        completion.usage.output_tokens,
                        duration
                    );
                    return Ok(Transcription {
                        markdown: postprocess::clean_output(&completion.content),
                        usage: completion.usage,
                        retries: attempt - 1,
                        duration_ms: duration.as_millis() as u64,
                    });
                }
                Err(msg) => {
                    warn!(
                        "Page {}: attempt {}/{} failed: {}",
                        page_num, attempt, self.max_attempts, msg
                    );
                    last_err = msg;
                }
            }

            if attempt < self.max_attempts {
                let backoff = self.config.backoff_for(attempt);
                debug!("Page {}: retrying in {:?}", page_num, backoff);
                sleep(backoff).await;
            }
        }

        Err(PageError::LlmFailed {
            page: page_num,
            attempts: self.max_attempts,
            detail: last_err,
        })
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Pdf2MdError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2MdError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    honoured only when both are set.
/// 4. **`OPENAI_API_KEY`** present: OpenAI with the configured model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, Pdf2MdError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2MdError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
