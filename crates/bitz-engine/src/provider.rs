use std::collections::VecDeque;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

/// One chat-style completion against a vision-capable model.
///
/// `messages` is the full role/content list; use the builders below to
/// attach images. All calls are network-bound and seconds-scale, so
/// every implementation must carry a bounded timeout.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Value>,
    pub json_response: bool,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            json_response: false,
            max_tokens: 2048,
        }
    }

    pub fn expecting_json(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

pub fn system_message(text: &str) -> Value {
    json!({"role": "system", "content": text})
}

pub fn user_message(text: &str) -> Value {
    json!({"role": "user", "content": text})
}

pub fn assistant_message(text: &str) -> Value {
    json!({"role": "assistant", "content": text})
}

/// User message carrying an inline JPEG as a data URL.
pub fn user_message_with_image(text: &str, image_b64: &str) -> Value {
    json!({
        "role": "user",
        "content": [
            {"type": "text", "text": text},
            {
                "type": "image_url",
                "image_url": {"url": format!("data:image/jpeg;base64,{image_b64}")},
            },
        ],
    })
}

pub struct OpenAiVisionProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OpenAiVisionProvider {
    pub fn new(model: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs_f64(request_timeout_seconds()))
            .build()
            .context("failed building HTTP client")?;
        Ok(Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.into(),
            http,
        })
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENAI_API_KEY")
    }
}

impl VisionProvider for OpenAiVisionProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("OPENAI_API_KEY not set");
        };

        let mut payload = json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
        });
        if request.json_response {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;

        let status = response.status();
        let code = status.as_u16();
        let body = response
            .text()
            .context("OpenAI response body read failed")?;
        if !status.is_success() {
            bail!(
                "OpenAI request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let parsed: Value =
            serde_json::from_str(&body).context("OpenAI returned invalid JSON payload")?;
        let content = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("OpenAI response missing message content"))?;
        Ok(content)
    }
}

/// Canned-reply provider for tests and offline runs. Replies are
/// served in order; an exhausted script fails the call, which callers
/// must degrade from like any provider failure.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().map(|count| *count).unwrap_or(0)
    }
}

impl VisionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted provider lock poisoned"))?;
        match replies.pop_front() {
            Some(reply) => Ok(reply),
            None => bail!("scripted provider exhausted"),
        }
    }
}

fn request_timeout_seconds() -> f64 {
    env::var("BITZ_MODEL_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(60.0)
        .clamp(5.0, 300.0)
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_provider_serves_replies_in_order() -> Result<()> {
        let provider = ScriptedProvider::new(vec!["one".to_string(), "two".to_string()]);
        let request = CompletionRequest::new(vec![user_message("hi")]);
        assert_eq!(provider.complete(&request)?, "one");
        assert_eq!(provider.complete(&request)?, "two");
        assert!(provider.complete(&request).is_err());
        assert_eq!(provider.calls(), 3);
        Ok(())
    }

    #[test]
    fn image_message_carries_data_url() {
        let message = user_message_with_image("look", "QUJD");
        let url = message["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or("");
        assert_eq!(url, "data:image/jpeg;base64,QUJD");
        assert_eq!(message["content"][0]["text"], "look");
    }

    #[test]
    fn completion_request_defaults() {
        let request = CompletionRequest::new(Vec::new());
        assert!(!request.json_response);
        assert_eq!(request.max_tokens, 2048);
        let request = request.expecting_json().with_max_tokens(1024);
        assert!(request.json_response);
        assert_eq!(request.max_tokens, 1024);
    }
}
