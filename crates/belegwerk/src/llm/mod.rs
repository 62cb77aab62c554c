//! The language-model collaborator contract: one `process` operation over a
//! narrow request/response shape. The orchestration never assumes streaming.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use http::HttpLanguageModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub tools: Option<Vec<ToolSpec>>,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
            tools: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Free-form label for logging and routing ("summarize", "plan", …).
    pub request_type: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub options: LlmOptions,
}

/// A raw tool call as the provider returned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Tool calls the pipeline understands. Anything else is discarded with a
/// warning, never executed.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownTool {
    WebSearch { query: String },
    DocumentSearch { query: String, limit: usize },
}

impl KnownTool {
    pub fn parse(call: &ToolCall) -> Option<Self> {
        match call.name.as_str() {
            "web_search" => {
                let query = call.input.get("query")?.as_str()?.to_string();
                Some(KnownTool::WebSearch { query })
            }
            "document_search" => {
                let query = call.input.get("query")?.as_str()?.to_string();
                let limit = call
                    .input
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(5) as usize;
                Some(KnownTool::DocumentSearch { query, limit })
            }
            _ => None,
        }
    }
}

/// Filter raw tool calls down to the known set.
pub fn resolve_tool_calls(calls: &[ToolCall]) -> Vec<KnownTool> {
    calls
        .iter()
        .filter_map(|call| {
            let known = KnownTool::parse(call);
            if known.is_none() {
                tracing::warn!(tool = %call.name, "discarding unknown tool call");
            }
            known
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

impl LlmResponse {
    pub fn text(&self) -> Option<&str> {
        if self.success {
            self.content.as_deref()
        } else {
            None
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn process(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Strip markdown code fences around a JSON payload; models love wrapping
/// their answers even when asked not to.
pub fn strip_json_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted model: pops canned responses in order; repeats the last one
    /// when the script runs out.
    pub struct ScriptedModel {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn process(&self, _request: LlmRequest) -> Result<LlmResponse> {
            let mut responses = self.responses.lock();
            let content = if responses.len() > 1 {
                responses.pop().unwrap_or_default()
            } else {
                responses.last().cloned().unwrap_or_default()
            };
            Ok(LlmResponse {
                success: true,
                content: Some(content),
                tool_calls: Vec::new(),
                error: None,
            })
        }
    }

    /// Model that always fails; exercises fallback paths.
    pub struct FailingModel;

    #[async_trait]
    impl LanguageModel for FailingModel {
        async fn process(&self, _request: LlmRequest) -> Result<LlmResponse> {
            Err(crate::error::Error::Transient("model unavailable".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tools_are_dropped() {
        let calls = vec![
            ToolCall {
                id: "1".into(),
                name: "web_search".into(),
                input: serde_json::json!({"query": "Verkehrswende"}),
            },
            ToolCall {
                id: "2".into(),
                name: "run_shell".into(),
                input: serde_json::json!({"cmd": "rm -rf /"}),
            },
        ];
        let known = resolve_tool_calls(&calls);
        assert_eq!(known.len(), 1);
        assert_eq!(
            known[0],
            KnownTool::WebSearch {
                query: "Verkehrswende".into()
            }
        );
    }

    #[test]
    fn fence_stripping_handles_plain_and_fenced() {
        assert_eq!(strip_json_fences("[1, 2]"), "[1, 2]");
        assert_eq!(strip_json_fences("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_json_fences("```\n{}\n```"), "{}");
    }
}
