//! Remote inference via a local Ollama endpoint
//!
//! All network concerns live behind the `Inference` trait so the heuristic
//! and verification logic can be exercised with a stub. The production
//! implementation posts to Ollama's `/api/generate` on localhost; an
//! unreachable service is a normal, recoverable failure of one generation
//! attempt, never a fatal error for the whole run.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3";

/// Free-text calls (patch and logic repair) get 30s; structured optimization
/// responses are larger and costlier to produce, so they get 60s.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(30);
const STRUCTURED_TIMEOUT: Duration = Duration::from_secs(60);

/// The two operations the repair pipeline needs from a model.
pub trait Inference {
    /// Free-text generation: natural-language-wrapped code.
    fn complete(&self, prompt: &str) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Structured generation: the model is asked for a JSON payload.
    fn complete_structured(
        &self,
        prompt: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaClient {
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        format: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let url = format!("{}/api/generate", self.endpoint);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format,
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Ollama request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Ollama error {}: {}",
                status,
                crate::util::ellipsize(&text, 200)
            ));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Ollama response: {}", e))?;

        Ok(parsed.response)
    }
}

impl Inference for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.generate(prompt, None, GENERATE_TIMEOUT).await
    }

    async fn complete_structured(&self, prompt: &str) -> Result<String> {
        self.generate(prompt, Some("json"), STRUCTURED_TIMEOUT).await
    }
}
