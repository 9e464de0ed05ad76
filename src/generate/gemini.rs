//! Gemini `generateContent` client.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};

use super::{GenerationError, GenerationRequest, InlineImage, TextGenerator};

pub const NO_CANDIDATES: &str = "No candidates returned.";

pub struct GeminiClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    text_timeout: Duration,
    image_timeout: Duration,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            text_timeout: Duration::from_secs(90),
            image_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeouts(mut self, text: Duration, image: Duration) -> Self {
        self.text_timeout = text;
        self.image_timeout = image;
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/{model}:generateContent", self.base_url)
    }
}

fn request_body(prompt: &str, image: Option<&InlineImage>) -> Value {
    let mut parts = vec![json!({ "text": prompt })];
    if let Some(image) = image {
        parts.push(json!({
            "inline_data": {
                "mime_type": image.mime_type,
                "data": image.data,
            }
        }));
    }
    json!({ "contents": [{ "parts": parts }] })
}

/// Text of the first candidate's first part
fn first_candidate_text(body: &Value) -> String {
    body.get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/content/parts/0/text"))
        .and_then(Value::as_str)
        .map_or_else(|| NO_CANDIDATES.to_string(), str::to_string)
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<String, GenerationError> {
        let timeout = if request.image.is_some() {
            self.image_timeout
        } else {
            self.text_timeout
        };

        let resp = self
            .http
            .post(self.endpoint(request.model))
            .query(&[("key", &self.api_key)])
            .timeout(timeout)
            .json(&request_body(request.prompt, request.image))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    GenerationError::Transient(e.to_string())
                } else {
                    GenerationError::Fatal(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 503 || status.as_u16() == 504 {
            return Err(GenerationError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Fatal(format!("HTTP {status}: {body}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::Fatal(format!("invalid response body: {e}")))?;
        Ok(first_candidate_text(&body))
    }
}

/// Download a screenshot for multimodal prompts. Any failure yields `None`
/// and the prompt goes out text-only.
pub async fn fetch_screenshot(http: &reqwest::Client, url: &str) -> Option<InlineImage> {
    let resp = match http.get(url).timeout(Duration::from_secs(10)).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            tracing::warn!("Screenshot fetch returned {}", resp.status());
            return None;
        }
        Err(e) => {
            tracing::warn!("Failed to fetch screenshot: {e}");
            return None;
        }
    };
    match resp.bytes().await {
        Ok(bytes) => Some(InlineImage {
            mime_type: "image/jpeg".into(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        }),
        Err(e) => {
            tracing::warn!("Failed to read screenshot body: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let client = GeminiClient::new("https://example.test/v1beta/", "k");
        assert_eq!(
            client.endpoint("models/gemini-1.5-pro-latest"),
            "https://example.test/v1beta/models/gemini-1.5-pro-latest:generateContent"
        );
    }

    #[test]
    fn test_request_body_with_image() {
        let image = InlineImage {
            mime_type: "image/jpeg".into(),
            data: "AAAA".into(),
        };
        let body = request_body("fix it", Some(&image));
        assert_eq!(body["contents"][0]["parts"][0]["text"], json!("fix it"));
        assert_eq!(
            body["contents"][0]["parts"][1]["inline_data"]["mime_type"],
            json!("image/jpeg")
        );

        let body = request_body("fix it", None);
        assert_eq!(body["contents"][0]["parts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_candidate_extraction() {
        let body = json!({"candidates": [{"content": {"parts": [{"text": "answer"}]}}]});
        assert_eq!(first_candidate_text(&body), "answer");
        assert_eq!(first_candidate_text(&json!({"candidates": []})), NO_CANDIDATES);
        assert_eq!(first_candidate_text(&json!({})), NO_CANDIDATES);
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let client = GeminiClient::new("http://127.0.0.1:9", "k");
        let err = client
            .generate(GenerationRequest {
                prompt: "p",
                model: "m",
                image: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Transient(_)));
    }

    #[tokio::test]
    async fn test_screenshot_failure_is_none() {
        let http = reqwest::Client::new();
        assert!(fetch_screenshot(&http, "http://127.0.0.1:9/shot.jpg").await.is_none());
    }
}
