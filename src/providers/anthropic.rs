//! Anthropic Messages API adapter.
//!
//! Vendor "B" in the spec's provider vocabulary: it has no structured-output
//! request field, so the `structured` flag on [`AiTransport::send`] is
//! accepted but ignored here, matching the original client's
//! `_call_anthropic`, which never threads a schema through.

use serde_json::{json, Value};

use super::{check_http_response, AiTransport, ProviderError};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider using `api_key` for authentication.
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl AiTransport for AnthropicProvider {
    async fn send(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
        _structured: bool,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "user", "content": prompt},
            ],
        });

        let response = self
            .client
            .post(ANTHROPIC_API_BASE)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        parse_reply_text(&payload)
    }
}

fn parse_reply_text(payload: &str) -> Result<String, ProviderError> {
    let parsed: Value =
        serde_json::from_str(payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let content_items = parsed
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Parse("missing content array".to_owned()))?;

    let mut text = String::new();
    for item in content_items {
        if item.get("type").and_then(Value::as_str) == Some("text") {
            text.push_str(item.get("text").and_then(Value::as_str).unwrap_or_default());
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_blocks_from_messages_payload() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "{\"actions\": []}"},
            ],
        })
        .to_string();
        assert_eq!(parse_reply_text(&payload).unwrap(), "{\"actions\": []}");
    }

    #[test]
    fn missing_content_array_is_a_parse_error() {
        let payload = json!({"no_content": true}).to_string();
        assert!(parse_reply_text(&payload).is_err());
    }
}
