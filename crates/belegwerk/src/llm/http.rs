//! OpenAI-compatible chat-completions provider.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use super::{LanguageModel, LlmRequest, LlmResponse, ToolCall};
use crate::error::{retry, Error, Result};

pub struct HttpLanguageModel {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLanguageModel {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Permanent(format!("llm client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    async fn request_once(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({"role": message.role, "content": message.content}));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.options.max_tokens,
            "temperature": request.options.temperature,
            "stream": false,
        });
        if let Some(ref tools) = request.options.tools {
            let tool_specs: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tool_specs);
        }

        let mut http_request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {key}"));
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| Error::from_http(e, "llm request"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transient(format!("llm body: {e}")))?;

        if status.is_server_error() {
            return Err(Error::Transient(format!("llm: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Permanent(format!("llm: HTTP {status}")));
        }

        // A proxy can hand back an HTML error page with a 200.
        if text.trim_start().starts_with('<') {
            return Err(Error::Transient(
                "llm endpoint returned HTML instead of JSON".into(),
            ));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Error::Permanent(format!("llm parse: {e}")))?;

        let message = &parsed["choices"][0]["message"];
        let content = message["content"].as_str().map(|s| s.to_string());

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = call.get("function")?;
                        let arguments = function.get("arguments")?.as_str()?;
                        let input = serde_json::from_str(arguments).ok()?;
                        Some(ToolCall {
                            id: call
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: function.get("name")?.as_str()?.to_string(),
                            input,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            success: true,
            content,
            tool_calls,
            error: None,
        })
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn process(&self, request: LlmRequest) -> Result<LlmResponse> {
        retry(3, Duration::from_millis(500), || self.request_once(&request)).await
    }
}
