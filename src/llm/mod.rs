//! LLM integration — reply generation via a local Ollama instance.
//!
//! Talks to Ollama's `/api/generate` endpoint (non-streaming). Requests are
//! retried a bounded number of times; when generation still fails, or the
//! model returns something implausibly short, the caller falls back to the
//! reply template so a correspondent always gets an answer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::LlmError;
use crate::templates::Templates;

/// Replies shorter than this are treated as a generation failure.
const MIN_REPLY_LEN: usize = 10;

/// Pause between retry attempts.
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Ollama client configuration.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl OllamaConfig {
    /// Build config from `OLLAMA_*` environment variables, with defaults.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama2".to_string()),
            max_retries: std::env::var("OLLAMA_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            timeout_secs: std::env::var("OLLAMA_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for a local Ollama instance.
pub struct OllamaClient {
    http: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "ollama".to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        info!(model = %config.model, url = %config.base_url, "Using Ollama");
        Ok(Self { http, config })
    }

    /// Send a prompt and return the completion, retrying on failure.
    pub async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_generate(&url, prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.config.max_retries => {
                    warn!(
                        attempt,
                        max = self.config.max_retries,
                        error = %e,
                        "Ollama request failed, retrying"
                    );
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_generate(&self, url: &str, prompt: &str) -> Result<String, LlmError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
        };

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "ollama".to_string(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| LlmError::RequestFailed {
                provider: "ollama".to_string(),
                reason: e.to_string(),
            })?;

        let parsed: GenerateResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: "ollama".to_string(),
                reason: e.to_string(),
            })?;

        Ok(parsed.response)
    }

    /// Generate a reply to an inbound email, falling back to the reply
    /// template when generation fails or returns a throwaway answer.
    pub async fn generate_reply(
        &self,
        templates: &Templates,
        sender: &str,
        subject: &str,
        body: &str,
    ) -> String {
        let prompt = reply_prompt(sender, subject, body);

        match self.generate(&prompt).await {
            Ok(reply) if reply.trim().len() >= MIN_REPLY_LEN => reply,
            Ok(_) => {
                warn!("Ollama reply too short, using template fallback");
                templates.render_default(subject, body)
            }
            Err(e) => {
                error!(error = %e, "Reply generation failed, using template fallback");
                templates.render_default(subject, body)
            }
        }
    }
}

/// Build the customer-support prompt for an inbound email.
pub fn reply_prompt(sender: &str, subject: &str, body: &str) -> String {
    format!(
        "You are an official customer support email assistant. Your role is to:\n\
         1. Provide professional and helpful responses to customer queries\n\
         2. Collect necessary information to create support tickets\n\
         3. Maintain a friendly yet professional tone\n\
         \n\
         For each email: analyze the customer's issue, identify what type of\n\
         issue it is (payment, account, technical, etc.), request any missing\n\
         information needed for a support ticket, and provide a clear next step.\n\
         \n\
         Current Email Details:\n\
         From: {sender}\n\
         Subject: {subject}\n\
         Message:\n\
         {body}\n\
         \n\
         Please generate an appropriate response following the above guidelines."
    )
}
