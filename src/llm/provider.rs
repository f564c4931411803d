//! LLM provider trait and common types
//!
//! This module defines the common interface that all LLM providers must
//! implement. The provider set is open: anything implementing [`LlmProvider`]
//! can be injected into the gateway.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Ollama,
    OpenAI,
    Anthropic,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Ollama => write!(f, "ollama"),
            ProviderType::OpenAI => write!(f, "openai"),
            ProviderType::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Configuration for a specific LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider type
    pub provider: ProviderType,

    /// Model name for text generation
    pub model: String,

    /// API key (usually from environment variable)
    pub api_key: Option<String>,

    /// Base URL for API calls
    pub base_url: Option<String>,

    /// Priority for fallback (lower is higher priority)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_priority() -> u8 {
    10
}

fn default_timeout() -> u64 {
    30
}

/// A text generation result with token accounting where available
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub model: String,
}

/// Trait that all LLM providers must implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider type
    fn provider_type(&self) -> ProviderType;

    /// Get the provider name
    fn name(&self) -> &str;

    /// Generate text from a prompt
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<GenerationResponse>;
}
