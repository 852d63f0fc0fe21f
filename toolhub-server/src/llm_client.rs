//! External LLM contract (§6.3): `Generate` distinguishing timeout,
//! connection-refused, and upstream error — all three count as a failure
//! against the `ollama` breaker.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call to {model_id} timed out after {elapsed:?}")]
    Timeout { model_id: String, elapsed: Duration },
    #[error("connection to the llm backend was refused")]
    ConnectionRefused,
    #[error("llm backend returned an error: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        model_id: &str,
        system_prompt: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// `reqwest`-backed client speaking Ollama's `/api/generate`.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        model_id: &str,
        system_prompt: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let body = GenerateRequest {
            model: model_id,
            system: system_prompt,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_transport_error(&err, model_id, timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream(format!("{status}: {text}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Upstream(err.to_string()))?;
        Ok(parsed.response)
    }
}

fn classify_transport_error(err: &reqwest::Error, model_id: &str, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout {
            model_id: model_id.to_string(),
            elapsed: timeout,
        }
    } else if err.is_connect() {
        LlmError::ConnectionRefused
    } else {
        LlmError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A test double exercising the enhancement service's breaker/cache
    /// wiring without a real Ollama process.
    pub struct CountingLlmClient {
        pub calls: Arc<AtomicUsize>,
        pub outcome: fn() -> Result<String, LlmError>,
    }

    #[async_trait]
    impl LlmClient for CountingLlmClient {
        async fn generate(
            &self,
            _model_id: &str,
            _system_prompt: &str,
            _prompt: &str,
            _temperature: f32,
            _max_tokens: u32,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    #[tokio::test]
    async fn counting_double_reports_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = CountingLlmClient {
            calls: Arc::clone(&calls),
            outcome: || Ok("enhanced".to_string()),
        };
        let result = client
            .generate("m", "sys", "p", 0.7, 128, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, "enhanced");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
