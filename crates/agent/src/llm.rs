use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use tunesmith_core::config::LlmConfig;

/// Boundary to the external text-generation service. Both the supervisor's
/// routing classification and the handlers' operation proposals go through
/// this one trait, so tests can script either side independently.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_COMPLETION_TOKENS: u32 = 1024;

pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("building llm http client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.as_ref().map(|key| key.expose_secret().to_string()),
            max_retries: config.max_retries,
        })
    }

    async fn request_once(&self, system: &str, user: &str) -> Result<String> {
        let api_key =
            self.api_key.as_deref().ok_or_else(|| anyhow!("llm api key is not configured"))?;

        let body = json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("sending completion request")?
            .error_for_status()
            .context("completion request rejected")?;

        let completion: CompletionResponse =
            response.json().await.context("decoding completion response")?;

        completion
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("completion response contained no text block"))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.request_once(system, user).await {
                Ok(text) => return Ok(text),
                Err(error) => {
                    warn!(
                        event_name = "llm.request_failed",
                        attempt,
                        max_retries = self.max_retries,
                        error = %error,
                        "completion attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("llm request failed")))
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}
