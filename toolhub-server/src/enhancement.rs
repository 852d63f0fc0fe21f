//! Enhancement service (C7): per-client rule lookup, cache lookup, and an
//! external LLM call gated by its own circuit breaker.
//!
//! Enhancement is always best-effort — a rejected breaker, a timeout, or an
//! upstream error all downgrade to returning the prompt unchanged rather
//! than failing the caller. The `ollama` breaker is deliberately separate
//! from the per-server breakers the proxy path uses: a flaky LLM backend
//! must never affect tool-call traffic.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use toolhub_mcp::breaker::CircuitBreakerRegistry;
use toolhub_mcp::cache::Cache;

use crate::config::{EnhancementConfig, EnhancementRule};
use crate::llm_client::LlmClient;

const OLLAMA_BREAKER_TARGET: &str = "ollama";

#[derive(Debug, Clone, Serialize)]
pub struct EnhanceResult {
    pub original: String,
    pub enhanced: String,
    pub cached: bool,
    pub was_enhanced: bool,
    pub error: Option<String>,
}

pub struct EnhancementService {
    rules: EnhancementConfig,
    cache: Arc<Cache<String>>,
    breakers: Arc<CircuitBreakerRegistry>,
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl EnhancementService {
    pub fn new(
        rules: EnhancementConfig,
        cache: Arc<Cache<String>>,
        breakers: Arc<CircuitBreakerRegistry>,
        llm: Arc<dyn LlmClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            rules,
            cache,
            breakers,
            llm,
            timeout,
        }
    }

    fn select_rule(&self, client_id: Option<&str>) -> &EnhancementRule {
        client_id
            .and_then(|id| self.rules.rules.get(id))
            .unwrap_or(&self.rules.default)
    }

    /// Deterministic fingerprint over the rule's parameters and the prompt,
    /// stable across processes (SHA-256 hex, not the rule's identity).
    fn cache_key(rule: &EnhancementRule, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(rule.model_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(rule.system_prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(rule.temperature.to_bits().to_le_bytes());
        hasher.update(rule.max_tokens.to_le_bytes());
        hasher.update([0u8]);
        hasher.update(prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn enhance(
        &self,
        prompt: &str,
        client_id: Option<&str>,
        bypass_cache: bool,
    ) -> EnhanceResult {
        let rule = self.select_rule(client_id);

        if !rule.enabled {
            return EnhanceResult {
                original: prompt.to_string(),
                enhanced: prompt.to_string(),
                cached: false,
                was_enhanced: false,
                error: None,
            };
        }

        let key = Self::cache_key(rule, prompt);

        if !bypass_cache {
            if let Some(cached) = self.cache.get(&key).await {
                return EnhanceResult {
                    original: prompt.to_string(),
                    enhanced: cached,
                    cached: true,
                    was_enhanced: true,
                    error: None,
                };
            }
        }

        if let Err(err) = self.breakers.check(OLLAMA_BREAKER_TARGET).await {
            tracing::warn!(error = %err, "enhancement circuit open, degrading to passthrough");
            return EnhanceResult {
                original: prompt.to_string(),
                enhanced: prompt.to_string(),
                cached: false,
                was_enhanced: false,
                error: Some("circuit_open".to_string()),
            };
        }

        match self
            .llm
            .generate(
                &rule.model_id,
                &rule.system_prompt,
                prompt,
                rule.temperature,
                rule.max_tokens,
                self.timeout,
            )
            .await
        {
            Ok(enhanced) => {
                self.breakers.record_success(OLLAMA_BREAKER_TARGET).await;
                self.cache.put(key, enhanced.clone()).await;
                EnhanceResult {
                    original: prompt.to_string(),
                    enhanced,
                    cached: false,
                    was_enhanced: true,
                    error: None,
                }
            }
            Err(err) => {
                self.breakers.record_failure(OLLAMA_BREAKER_TARGET).await;
                tracing::warn!(error = %err, "enhancement llm call failed, degrading to passthrough");
                EnhanceResult {
                    original: prompt.to_string(),
                    enhanced: prompt.to_string(),
                    cached: false,
                    was_enhanced: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
