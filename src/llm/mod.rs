//! LLM gateway with global rate limiting and provider fallback

pub mod provider;
pub mod providers;

pub use provider::{GenerationResponse, LlmProvider, ProviderConfig, ProviderType};
pub use providers::{AnthropicProvider, OllamaProvider, OpenAiProvider};

use crate::config::LlmConfig;
use crate::error::{LlmError, RagError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Process-global request rate limiter.
///
/// Enforces at most `max_per_minute` requests in any window and a minimum
/// gap between consecutive requests. Near the per-minute ceiling an extra
/// fixed delay is inserted and the counter waits out the minute boundary.
pub struct RateLimiter {
    max_per_minute: u32,
    min_interval: Duration,
    near_limit_delay: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    window_start: Instant,
    count: u32,
    last_request: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32, min_interval: Duration) -> Self {
        Self {
            max_per_minute: max_per_minute.max(1),
            min_interval,
            near_limit_delay: Duration::from_secs(2),
            state: Mutex::new(LimiterState {
                window_start: Instant::now(),
                count: 0,
                last_request: None,
            }),
        }
    }

    /// Block until a request slot is available.
    ///
    /// Callers are serialised through the internal lock, which is what makes
    /// the limit process-global.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        if now.duration_since(state.window_start) >= Duration::from_secs(60) {
            state.window_start = now;
            state.count = 0;
        }

        if let Some(last) = state.last_request {
            let since = now.duration_since(last);
            if since < self.min_interval {
                sleep(self.min_interval - since).await;
            }
        }

        if state.count + 1 >= self.max_per_minute {
            debug!(
                "Approaching rate limit ({}/min), inserting delay",
                self.max_per_minute
            );
            sleep(self.near_limit_delay).await;

            let elapsed = state.window_start.elapsed();
            if elapsed < Duration::from_secs(60) {
                sleep(Duration::from_secs(60) - elapsed).await;
            }
            state.window_start = Instant::now();
            state.count = 0;
        }

        state.count += 1;
        state.last_request = Some(Instant::now());
    }
}

/// Gateway in front of the configured LLM providers.
///
/// Applies the global rate limit before dispatch and falls back through
/// providers in priority order. Individual calls are not retried; the caller
/// decides retry policy.
pub struct LlmGateway {
    providers: Vec<Arc<dyn LlmProvider>>,
    limiter: RateLimiter,
    config: LlmConfig,
}

impl LlmGateway {
    /// Build a gateway over an injected provider set (priority order)
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: LlmConfig) -> Self {
        info!(
            "LLM gateway initialized with {} provider(s), {} req/min",
            providers.len(),
            config.requests_per_minute
        );
        let limiter = RateLimiter::new(
            config.requests_per_minute,
            Duration::from_millis(config.min_request_interval_ms),
        );
        Self {
            providers,
            limiter,
            config,
        }
    }

    /// Build a gateway from configuration with the named provider
    pub fn from_config(config: LlmConfig) -> Result<Self> {
        let provider_config = ProviderConfig {
            provider: match config.provider.to_lowercase().as_str() {
                "ollama" => ProviderType::Ollama,
                "openai" => ProviderType::OpenAI,
                "anthropic" => ProviderType::Anthropic,
                other => {
                    return Err(RagError::Config(format!(
                        "Unsupported LLM provider: {}",
                        other
                    )))
                }
            },
            model: config.model_name.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            priority: 0,
            timeout: config.timeout,
        };

        let provider: Arc<dyn LlmProvider> = match provider_config.provider {
            ProviderType::Ollama => Arc::new(OllamaProvider::new(&provider_config)),
            ProviderType::OpenAI => Arc::new(OpenAiProvider::new(&provider_config)?),
            ProviderType::Anthropic => Arc::new(AnthropicProvider::new(&provider_config)?),
        };

        Ok(Self::new(vec![provider], config))
    }

    /// Generate text for a prompt using configured defaults
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with(prompt, self.config.max_tokens, self.config.temperature)
            .await
    }

    /// Generate text with explicit limits
    pub async fn generate_with(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        if self.providers.is_empty() {
            return Err(LlmError::AllProvidersFailed.into());
        }

        self.limiter.acquire().await;

        let mut last_error: Option<RagError> = None;
        for (idx, provider) in self.providers.iter().enumerate() {
            match provider.generate(prompt, max_tokens, temperature).await {
                Ok(response) => {
                    if idx > 0 {
                        debug!("Fallback provider {} answered", provider.name());
                    }
                    return Ok(response.text);
                }
                Err(e) => {
                    warn!("Provider {} failed: {}", provider.name(), e);
                    last_error = Some(e);
                    if !self.config.enable_fallback {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::AllProvidersFailed.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::{automock, predicate};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[automock]
    #[async_trait]
    #[allow(dead_code)]
    pub trait MockableLlm: Send + Sync {
        async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32)
            -> Result<String>;
    }

    struct ScriptedProvider {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Ollama
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn generate(
            &self,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(LlmError::GenerationFailed("scripted failure".to_string()).into())
            } else {
                Ok(GenerationResponse {
                    text: format!("answer from {}", self.name),
                    tokens_used: Some(10),
                    model: "test".to_string(),
                })
            }
        }
    }

    fn fast_config() -> LlmConfig {
        LlmConfig {
            requests_per_minute: 1000,
            min_request_interval_ms: 0,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_gateway_uses_primary() {
        let gateway = LlmGateway::new(
            vec![
                Arc::new(ScriptedProvider {
                    name: "primary",
                    fail: false,
                    calls: AtomicUsize::new(0),
                }),
                Arc::new(ScriptedProvider {
                    name: "backup",
                    fail: false,
                    calls: AtomicUsize::new(0),
                }),
            ],
            fast_config(),
        );

        let text = gateway.generate("hello").await.unwrap();
        assert_eq!(text, "answer from primary");
    }

    #[tokio::test]
    async fn test_gateway_falls_back() {
        let gateway = LlmGateway::new(
            vec![
                Arc::new(ScriptedProvider {
                    name: "primary",
                    fail: true,
                    calls: AtomicUsize::new(0),
                }),
                Arc::new(ScriptedProvider {
                    name: "backup",
                    fail: false,
                    calls: AtomicUsize::new(0),
                }),
            ],
            fast_config(),
        );

        let text = gateway.generate("hello").await.unwrap();
        assert_eq!(text, "answer from backup");
    }

    #[tokio::test]
    async fn test_gateway_all_failed() {
        let gateway = LlmGateway::new(
            vec![Arc::new(ScriptedProvider {
                name: "primary",
                fail: true,
                calls: AtomicUsize::new(0),
            })],
            fast_config(),
        );

        assert!(gateway.generate("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_mocked_provider_contract() {
        let mut mock = MockMockableLlm::new();
        mock.expect_generate()
            .with(
                predicate::eq("ping"),
                predicate::always(),
                predicate::always(),
            )
            .times(1)
            .returning(|_, _, _| Ok("pong".to_string()));

        let answer = mock.generate("ping", 100, 0.1).await.unwrap();
        assert_eq!(answer, "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(3, Duration::from_millis(0));
        let start = Instant::now();

        // First two slots fit in the window
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(60));

        // The third approaches the ceiling and waits out the minute
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_min_interval() {
        let limiter = RateLimiter::new(1000, Duration::from_millis(250));
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Two enforced gaps of 250ms each
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
