//! Configuration types for the page-processing pipeline.
//!
//! All pipeline behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The same config drives a full run,
//! a single-page regeneration and the scheduler, so model parameters never
//! drift between the three paths.

use crate::error::Pdf2MdError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a document run.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf2md_pipeline::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .concurrency(4)
///     .model("gpt-4o")
///     .max_attempts(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 4);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Maximum number of page conversions in flight for one document. Default: 2.
    ///
    /// Only conversion is bounded; rendering keeps producing pages while the
    /// gate is full.
    pub concurrency: usize,

    /// Maximum number of documents processed at once by a
    /// [`crate::tasks::Scheduler`]. Default: 2.
    pub max_tasks: usize,

    /// LLM model identifier, e.g. "gpt-4o". If None, the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.3.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Total attempts per page (first call included). Default: 3.
    pub max_attempts: u32,

    /// Base retry delay in milliseconds. Default: 500.
    ///
    /// Linear: the wait after attempt `n` (1-indexed) is `n × retry_backoff_ms`,
    /// so 500 ms → 1 s with the defaults.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single completion attempt, in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Optional deadline for a whole document run, in seconds. Default: None.
    pub document_timeout_secs: Option<u64>,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Custom user prompt. If None, uses the built-in default.
    pub user_prompt: Option<String>,

    /// Rendering DPI used when rasterising each PDF page. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_tasks: 2,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.3,
            max_tokens: 4096,
            max_attempts: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            document_timeout_secs: None,
            system_prompt: None,
            user_prompt: None,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("concurrency", &self.concurrency)
            .field("max_tasks", &self.max_tasks)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("document_timeout_secs", &self.document_timeout_secs)
            .field("dpi", &self.dpi)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Wait inserted before retry number `attempt` (1-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn document_timeout(&self) -> Option<Duration> {
        self.document_timeout_secs.map(Duration::from_secs)
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_tasks(mut self, n: usize) -> Self {
        self.config.max_tasks = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn document_timeout_secs(mut self, secs: u64) -> Self {
        self.config.document_timeout_secs = Some(secs);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.user_prompt = Some(prompt.into());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2MdError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(Pdf2MdError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(Pdf2MdError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(Pdf2MdError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.document_timeout_secs == Some(0) {
            return Err(Pdf2MdError::InvalidConfig(
                "document_timeout_secs must be ≥ 1 when set".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings() {
        let c = ConversionConfig::default();
        assert_eq!(c.concurrency, 2);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.max_tokens, 4096);
        assert!((c.temperature - 0.3).abs() < f32::EPSILON);
        assert!(c.document_timeout().is_none());
    }

    #[test]
    fn concurrency_is_clamped_to_one() {
        let c = ConversionConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn backoff_is_linear() {
        let c = ConversionConfig::builder()
            .retry_backoff_ms(250)
            .build()
            .unwrap();
        assert_eq!(c.backoff_for(1), Duration::from_millis(250));
        assert_eq!(c.backoff_for(2), Duration::from_millis(500));
        assert_eq!(c.backoff_for(3), Duration::from_millis(750));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = ConversionConfig::builder().max_attempts(0).build().unwrap_err();
        assert!(matches!(err, Pdf2MdError::InvalidConfig(_)));
    }

    #[test]
    fn zero_document_timeout_rejected() {
        let err = ConversionConfig::builder()
            .document_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("document_timeout_secs"));
    }
}
