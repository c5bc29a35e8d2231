//! AI transport adapters.
//!
//! The runtime needs exactly one capability from a vendor: send a rendered
//! heartbeat prompt, get back the model's raw text reply. Grounded on the
//! teacher's `LlmProvider` trait (formerly in this file) and simplified to
//! this crate's single-prompt, non-tool-calling use — tool-calling belongs
//! to the teacher's chat-agent domain, not to heartbeat dispatch, which
//! parses actions out of plain text per the reply-parsing rules in
//! `crate::heartbeat`.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use regex::Regex;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Errors surfaced by an [`AiTransport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The response body could not be parsed into the expected shape.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream vendor responded with a non-success status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// No credential was available for this vendor.
    #[error("missing credential for vendor '{0}'")]
    MissingCredential(String),
}

/// A vendor-agnostic AI transport: render a prompt, get back raw text.
///
/// `structured` requests the vendor's native structured-output mode where
/// supported. The OpenAI-compatible adapter honors it via
/// `response_format: json_schema`; the Anthropic adapter ignores it, since
/// Anthropic's Messages API has no equivalent request field.
#[async_trait]
pub trait AiTransport: Send + Sync {
    /// Send `prompt` to `model` and return the raw text reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failure, non-success HTTP
    /// status, or an unparsable response body.
    async fn send(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
        structured: bool,
    ) -> Result<String, ProviderError>;
}

/// Parse a `<vendor>/<model>` spec string into its two parts.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] if `spec` has no non-empty `/`-separated
/// halves.
pub fn parse_model_spec(spec: &str) -> Result<(&str, &str), ProviderError> {
    let (vendor, model) = spec
        .split_once('/')
        .ok_or_else(|| ProviderError::Parse(format!("model spec '{spec}' missing '<vendor>/<model>' separator")))?;
    if vendor.is_empty() || model.is_empty() {
        return Err(ProviderError::Parse(format!(
            "model spec '{spec}' has an empty vendor or model half"
        )));
    }
    Ok((vendor, model))
}

/// Check HTTP response status and return the body text, or a structured
/// error with a secret-redacted body.
///
/// # Errors
///
/// Returns [`ProviderError::Request`] on transport failure,
/// [`ProviderError::HttpStatus`] on non-2xx.
pub(crate) async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"Bearer [A-Za-z0-9_\-\.]{10,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vendor_and_model() {
        let (vendor, model) = parse_model_spec("anthropic/claude-3-5-sonnet").unwrap();
        assert_eq!(vendor, "anthropic");
        assert_eq!(model, "claude-3-5-sonnet");
    }

    #[test]
    fn rejects_spec_without_separator() {
        assert!(parse_model_spec("claude-3-5-sonnet").is_err());
    }

    #[test]
    fn redacts_bearer_tokens_in_error_bodies() {
        let body = "unauthorized: Bearer sk-ant-abcdefghijklmnop rejected";
        let cleaned = sanitize_http_error_body(body);
        assert!(!cleaned.contains("abcdefghijklmnop"));
    }

    #[test]
    fn leaves_plain_bodies_untouched() {
        let body = r#"{"error": "rate limited"}"#;
        assert_eq!(sanitize_http_error_body(body), body);
    }
}
