use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A message in a session's conversation log.
///
/// An assistant message carrying `tool_calls` must be followed by exactly one
/// tool-role message per call (matched by `tool_call_id`); that sequence is
/// atomic for windowing and compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable id, assigned on first persistence. Empty until then.
    #[serde(default)]
    pub id: String,
    pub role: String, // "system", "user", "assistant", "tool"
    /// May be empty when an assistant message only carries tool calls.
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::bare("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::bare("system", content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::bare("assistant", content);
        msg.tool_calls = Some(calls);
        msg
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::bare("tool", content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }

    fn bare(role: &str, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }

    /// Project into the wire shape providers expect.
    pub fn to_provider_value(&self) -> Value {
        let mut obj = json!({
            "role": self.role,
            "content": self.content,
        });
        if let Some(calls) = &self.tool_calls {
            obj["tool_calls"] = Value::Array(calls.iter().map(ToolCall::to_provider_value).collect());
        }
        if let Some(tcid) = &self.tool_call_id {
            obj["tool_call_id"] = json!(tcid);
        }
        if let Some(name) = &self.tool_name {
            obj["name"] = json!(name);
        }
        obj
    }
}

/// A single tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Structured argument object, already parsed from the provider.
    pub arguments: Value,
}

impl ToolCall {
    pub fn to_provider_value(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments.to_string(),
            }
        })
    }
}

/// Rolling summary of a session's compressed head.
///
/// `compressed_count` head messages of the persisted log are covered by
/// `content` and skipped when the session is rematerialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub content: String,
    pub compressed_count: usize,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_calls_reports_tool_calls() {
        let msg = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "tc1".into(),
                name: "get_datetime".into(),
                arguments: json!({}),
            }],
        );
        assert!(msg.has_tool_calls());
        assert!(!ChatMessage::assistant("hi").has_tool_calls());
    }

    #[test]
    fn provider_value_carries_tool_fields() {
        let msg = ChatMessage::tool_result("tc1", "get_datetime", "2024-01-02T03:04:05Z");
        let v = msg.to_provider_value();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "tc1");
        assert_eq!(v["name"], "get_datetime");
    }

    #[test]
    fn tool_call_arguments_serialized_as_string() {
        let tc = ToolCall {
            id: "tc1".into(),
            name: "run".into(),
            arguments: json!({"cmd": "ls"}),
        };
        let v = tc.to_provider_value();
        assert_eq!(v["function"]["name"], "run");
        assert!(v["function"]["arguments"].is_string());
    }
}
