//! OpenAI-compatible Chat Completions adapter.
//!
//! Vendor "A": when `structured` is requested, the request carries
//! `response_format: {type: "json_schema", json_schema: ACTION_RESPONSE_SCHEMA}`,
//! the exact schema the original client builds in `client.py` for its
//! structured reply mode.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{check_http_response, AiTransport, ProviderError};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1/chat/completions";

/// The reply schema requested when a heartbeat asks for structured output.
pub fn action_response_schema() -> Value {
    json!({
        "name": "action_response",
        "strict": true,
        "schema": {
            "type": "object",
            "properties": {
                "actions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent_id": {"type": "string"},
                            "action": {"type": "string"},
                            "params": {"type": "object"},
                        },
                        "required": ["agent_id", "action"],
                    },
                },
            },
            "required": ["actions"],
        },
    })
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible Chat Completions provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider against the default OpenAI API base.
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            api_base: DEFAULT_API_BASE.to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a provider against a custom, OpenAI-compatible API base (used
    /// for self-hosted and third-party Chat Completions endpoints).
    pub fn with_api_base(api_key: String, api_base: String) -> Self {
        Self {
            api_key,
            api_base,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl AiTransport for OpenAiProvider {
    async fn send(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
        structured: bool,
    ) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            response_format: structured.then(action_response_schema),
        };

        let response = self
            .client
            .post(&self.api_base)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        parse_reply_text(&payload)
    }
}

fn parse_reply_text(payload: &str) -> Result<String, ProviderError> {
    let parsed: ChatResponse =
        serde_json::from_str(payload).map_err(|e| ProviderError::Parse(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("missing choices[0]".to_owned()))?;
    Ok(choice.message.content.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_choice_content() {
        let payload = json!({
            "choices": [
                {"message": {"content": "{\"actions\": []}"}},
            ],
        })
        .to_string();
        assert_eq!(parse_reply_text(&payload).unwrap(), "{\"actions\": []}");
    }

    #[test]
    fn missing_choices_is_a_parse_error() {
        let payload = json!({"choices": []}).to_string();
        assert!(parse_reply_text(&payload).is_err());
    }

    #[test]
    fn action_response_schema_requires_actions_array() {
        let schema = action_response_schema();
        assert_eq!(schema["schema"]["required"][0], json!("actions"));
    }
}
