//! Text generation collaborator and the two-tier retry/fallback policy.

pub mod gemini;

pub use gemini::{fetch_screenshot, GeminiClient};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::error::{Error, Result};

/// Base64-encoded image sent alongside the prompt
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
    pub image: Option<&'a InlineImage>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// Overload, gateway timeout, or network failure; worth retrying
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> std::result::Result<String, GenerationError>;
}

pub type SharedGenerator = Arc<dyn TextGenerator>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Success { text: String, model: String },
    /// Every tier ran out of attempts on transient failures
    Exhausted {
        models: Vec<String>,
        last_error: String,
    },
    /// A non-transient failure stopped the run
    Failed { model: String, message: String },
}

impl GenerationOutcome {
    /// Text and the model that produced it, or the matching core error
    pub fn into_result(self) -> Result<(String, String)> {
        match self {
            GenerationOutcome::Success { text, model } => Ok((text, model)),
            GenerationOutcome::Exhausted { models, last_error } => {
                Err(Error::ModelOverloaded { models, last_error })
            }
            GenerationOutcome::Failed { model, message } => Err(Error::Generation { model, message }),
        }
    }
}

/// Primary model, then fallback, each retried on transient failures
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    pub primary: String,
    pub fallback: Option<String>,
    /// Attempts per tier, at least one
    pub attempts: u32,
    pub backoff: Duration,
}

impl FallbackPolicy {
    pub fn new(primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback,
            attempts: 2,
            backoff: Duration::from_secs(5),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn tiers(&self) -> Vec<&str> {
        let mut tiers = vec![self.primary.as_str()];
        if let Some(fallback) = self.fallback.as_deref() {
            if fallback != self.primary {
                tiers.push(fallback);
            }
        }
        tiers
    }

    pub async fn run(
        &self,
        generator: &dyn TextGenerator,
        prompt: &str,
        image: Option<&InlineImage>,
    ) -> GenerationOutcome {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();

        for model in self.tiers() {
            for attempt in 1..=attempts {
                let request = GenerationRequest {
                    prompt,
                    model,
                    image,
                };
                match generator.generate(request).await {
                    Ok(text) => {
                        return GenerationOutcome::Success {
                            text,
                            model: model.to_string(),
                        }
                    }
                    Err(GenerationError::Fatal(message)) => {
                        tracing::warn!("{model} failed: {message}");
                        return GenerationOutcome::Failed {
                            model: model.to_string(),
                            message,
                        };
                    }
                    Err(GenerationError::Transient(message)) => {
                        tracing::warn!("{model} attempt {attempt}/{attempts} failed: {message}");
                        last_error = message;
                        if attempt < attempts {
                            tokio::time::sleep(self.backoff).await;
                        }
                    }
                }
            }
            tracing::info!("{model} unavailable, moving to next model");
        }

        GenerationOutcome::Exhausted {
            models: self.tiers().into_iter().map(str::to_string).collect(),
            last_error,
        }
    }
}
