use crate::error::ProviderError;
use crate::traits::{Completion, CompletionRequest, ReasoningClient};
use async_trait::async_trait;
use serde_json::json;

const MAX_NAME_CHARS: usize = 40;

/// Offline stand-in used when no credential is configured. Returns one
/// `Concept` named after the first word-like token of the chunk.
pub struct StubReasoningClient {
    provider: String,
    model: String,
}

impl StubReasoningClient {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ReasoningClient for StubReasoningClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let entities = match first_token(&request.source_text) {
            Some(name) => vec![json!({"name": name, "type": "Concept", "count": 1})],
            None => Vec::new(),
        };
        Ok(Completion {
            content: json!({"entities": entities, "relations": []}).to_string(),
            usage: None,
        })
    }
}

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ('\u{4e00}'..='\u{9fff}').contains(&ch)
}

/// First run of at least two token characters, cut to a short name.
fn first_token(text: &str) -> Option<String> {
    text.split(|ch: char| !is_token_char(ch))
        .find(|token| token.chars().count() >= 2)
        .map(|token| token.chars().take(MAX_NAME_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate_extraction;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            system: String::new(),
            prompt: String::new(),
            source_text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn stub_output_passes_validation() -> Result<(), Box<dyn std::error::Error>> {
        let client = StubReasoningClient::new("openai", "gpt-4o-mini");
        let completion = client.complete(&request("... a 知识图谱 builder")).await?;

        let result = validate_extraction(&completion.content)?;
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].name, "知识图谱");
        Ok(())
    }

    #[tokio::test]
    async fn text_without_tokens_yields_empty_result() -> Result<(), Box<dyn std::error::Error>> {
        let client = StubReasoningClient::new("openai", "gpt-4o-mini");
        let completion = client.complete(&request("a . b !")).await?;
        let result = validate_extraction(&completion.content)?;
        assert!(result.entities.is_empty());
        Ok(())
    }
}
