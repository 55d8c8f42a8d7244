use crate::error::ProviderError;
use crate::models::{ProviderConfig, ResponseShape};
use crate::providers::stub::StubReasoningClient;
use crate::traits::{ClientFactory, Completion, CompletionRequest, ReasoningClient, TokenUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const TEMPERATURE: f64 = 0.1;

/// Talks to an OpenAI compatible chat endpoint or the Gemini REST API,
/// depending on the configured response shape.
pub struct HttpReasoningClient {
    config: ProviderConfig,
    client: Client,
}

impl HttpReasoningClient {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config.endpoint.as_str().trim_end_matches('/')
    }

    async fn post(&self, url: String, body: Value) -> Result<String, ProviderError> {
        let mut request = self.client.post(url).json(&body);
        match (self.config.shape, self.config.credential.as_deref()) {
            (ResponseShape::OpenaiChat, Some(credential)) => request = request.bearer_auth(credential),
            (ResponseShape::Gemini, Some(credential)) => request = request.header("x-goog-api-key", credential),
            (_, None) => {}
        }

        let response = request.send().await?;
        let status = response.status();
        let retry_after = retry_after_header(response.headers(), Utc::now());
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message: error_message(&text).unwrap_or_else(|| status.to_string()),
                retry_after: retry_after.or_else(|| gemini_retry_delay(&text)),
            });
        }
        Ok(text)
    }

    async fn complete_chat(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = json!({
            "model": self.config.model,
            "temperature": TEMPERATURE,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "response_format": {"type": "json_object"},
        });

        let text = self.post(format!("{}/chat/completions", self.base_url()), body).await?;
        parse_chat_response(&text)
    }

    async fn complete_gemini(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = json!({
            "systemInstruction": {"parts": [{"text": request.system}]},
            "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "responseMimeType": "application/json",
            },
        });

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url(), self.config.model);
        let text = self.post(url, body).await?;
        parse_gemini_response(&text)
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    fn provider(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        match self.config.shape {
            ResponseShape::OpenaiChat => self.complete_chat(request).await,
            ResponseShape::Gemini => self.complete_gemini(request).await,
        }
    }
}

/// Builds HTTP clients, or the offline stub when the profile has no credential.
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(&self, config: &ProviderConfig) -> Result<Arc<dyn ReasoningClient>, ProviderError> {
        if config.credential.is_none() {
            return Ok(Arc::new(StubReasoningClient::new(&config.name, &config.model)));
        }
        Ok(Arc::new(HttpReasoningClient::new(config.clone(), self.timeout)?))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

fn parse_chat_response(body: &str) -> Result<Completion, ProviderError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|error| ProviderError::EmptyResponse(format!("unexpected chat response: {error}")))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| ProviderError::EmptyResponse("chat response had no message content".to_string()))?;

    Ok(Completion {
        content,
        usage: response.usage.map(|usage| TokenUsage {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
        }),
    })
}

fn parse_gemini_response(body: &str) -> Result<Completion, ProviderError> {
    let response: GeminiResponse = serde_json::from_str(body)
        .map_err(|error| ProviderError::EmptyResponse(format!("unexpected gemini response: {error}")))?;

    let content = response
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .collect::<String>();
    if content.trim().is_empty() {
        return Err(ProviderError::EmptyResponse("gemini response had no text parts".to_string()));
    }

    Ok(Completion {
        content,
        usage: response.usage_metadata.map(|usage| TokenUsage {
            input: usage.prompt_token_count,
            output: usage.candidates_token_count,
        }),
    })
}

/// `Retry-After` is either delay seconds or an HTTP date.
fn retry_after_header(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Gemini reports the delay as `RetryInfo.retryDelay`, e.g. `"31s"`.
fn gemini_retry_delay(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/details")?
        .as_array()?
        .iter()
        .filter_map(|detail| detail.get("retryDelay")?.as_str())
        .find_map(|delay| delay.strip_suffix('s')?.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(message) => Some(message.clone()),
        error => error.get("message")?.as_str().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn chat_content_and_usage_are_read() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "{\"entities\": []}"}}],
                       "usage": {"prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128}}"#;
        let completion = parse_chat_response(body).unwrap();
        assert_eq!(completion.content, "{\"entities\": []}");
        assert_eq!(completion.usage, Some(TokenUsage { input: 120, output: 8 }));

        assert!(matches!(
            parse_chat_response(r#"{"choices": []}"#),
            Err(ProviderError::EmptyResponse(_))
        ));
    }

    #[test]
    fn gemini_parts_are_concatenated() {
        let body = r#"{"candidates": [{"content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}}],
                       "usageMetadata": {"promptTokenCount": 50, "candidatesTokenCount": 4}}"#;
        let completion = parse_gemini_response(body).unwrap();
        assert_eq!(completion.content, "{\"a\":1}");
        assert_eq!(completion.usage, Some(TokenUsage { input: 50, output: 4 }));
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = DateTime::parse_from_rfc2822("Wed, 01 May 2024 12:00:00 GMT")
            .unwrap()
            .with_timezone(&Utc);

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_header(&headers, now), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 01 May 2024 12:00:30 GMT"));
        assert_eq!(retry_after_header(&headers, now), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after_header(&headers, now), None);
    }

    #[test]
    fn error_bodies_yield_message_and_delay() {
        let body = r#"{"error": {"code": 429, "message": "Resource has been exhausted",
            "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "31s"}]}}"#;
        assert_eq!(error_message(body).as_deref(), Some("Resource has been exhausted"));
        assert_eq!(gemini_retry_delay(body), Some(Duration::from_secs(31)));

        assert_eq!(error_message(r#"{"error": "bad key"}"#).as_deref(), Some("bad key"));
        assert_eq!(error_message("<html>"), None);
    }

    #[test]
    fn factory_falls_back_to_stub_without_credential() {
        let config = ProviderConfig {
            name: "openai".to_string(),
            endpoint: url::Url::parse("https://api.openai.com/v1").unwrap(),
            credential: None,
            model: "gpt-4o-mini".to_string(),
            shape: ResponseShape::OpenaiChat,
            chunking: crate::chunking::ChunkingPolicy::default(),
        };
        let client = HttpClientFactory::new(Duration::from_secs(5)).client(&config).unwrap();
        assert_eq!(client.provider(), "openai");
        assert_eq!(client.model(), "gpt-4o-mini");
    }
}
