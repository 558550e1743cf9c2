use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::providers::{ProviderError, ProviderErrorKind};
use crate::traits::{ChatOptions, FinishReason, ModelProvider, ProviderResponse, TokenUsage, ToolCall};

/// Adapter for any /chat/completions endpoint speaking the OpenAI dialect.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn build_body(&self, model: &str, messages: &[Value], tools: &[Value], options: &ChatOptions) -> Value {
        let mut all_messages = Vec::with_capacity(messages.len() + 1);
        if !options.system_prompt.is_empty() {
            all_messages.push(json!({
                "role": "system",
                "content": options.system_prompt,
            }));
        }
        all_messages.extend(messages.iter().cloned());

        let mut body = json!({
            "model": model,
            "messages": all_messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    fn parse_response(data: &Value) -> anyhow::Result<ProviderResponse> {
        let choice = data["choices"]
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("No choices in provider response"))?;
        let message = &choice["message"];

        let content = message["content"].as_str().map(|s| s.to_string());
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|tc| {
                        let id = tc["id"].as_str()?;
                        let name = tc["function"]["name"].as_str()?;
                        let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
                        let arguments =
                            serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
                        Some(ToolCall {
                            id: id.to_string(),
                            name: name.to_string(),
                            arguments,
                        })
                    })
                    .collect::<Vec<ToolCall>>()
            })
            .unwrap_or_default();

        let finish_reason = choice["finish_reason"]
            .as_str()
            .map(FinishReason::parse)
            .unwrap_or_default();

        let usage = data.get("usage").map(|u| TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(ProviderResponse {
            content,
            tool_calls,
            usage,
            finish_reason,
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ProviderResponse> {
        let body = self.build_body(model, messages, tools, options);
        let url = format!("{}/chat/completions", self.base_url);
        info!(model, url = %url, tools = tools.len(), "Calling LLM API");

        let resp = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e).into());
            }
        };

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            error!(status = %status, "Provider API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text).into());
        }
        debug!(bytes = text.len(), "Provider response received");

        let data: Value = serde_json::from_str(&text).map_err(|e| ProviderError {
            kind: ProviderErrorKind::ServerError,
            status: Some(200),
            message: format!("Malformed provider response (JSON parse error: {})", e),
            retry_after_secs: None,
        })?;
        Self::parse_response(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_injects_system_prompt_first() {
        let provider = OpenAiCompatibleProvider::new("https://api.test/v1", "sk").unwrap();
        let options = ChatOptions {
            system_prompt: "be brief".to_string(),
            temperature: 0.2,
            max_tokens: 128,
        };
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let body = provider.build_body("m", &messages, &[], &options);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["temperature"], 0.2);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn parse_text_response() {
        let data = json!({
            "choices": [{
                "message": { "content": "It's 03:04 UTC" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 6 }
        });
        let resp = OpenAiCompatibleProvider::parse_response(&data).unwrap();
        assert_eq!(resp.content.as_deref(), Some("It's 03:04 UTC"));
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.unwrap().input_tokens, 12);
    }

    #[test]
    fn parse_tool_call_response() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "tc1",
                        "type": "function",
                        "function": { "name": "get_datetime", "arguments": "{\"tz\":\"UTC\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = OpenAiCompatibleProvider::parse_response(&data).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "get_datetime");
        assert_eq!(resp.tool_calls[0].arguments["tz"], "UTC");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn unparseable_arguments_become_empty_object() {
        let data = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "tc1",
                        "function": { "name": "t", "arguments": "not json" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = OpenAiCompatibleProvider::parse_response(&data).unwrap();
        assert!(resp.tool_calls[0].arguments.as_object().unwrap().is_empty());
    }
}
