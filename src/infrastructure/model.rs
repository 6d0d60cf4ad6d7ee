use crate::types::{ConversationTurn, FunctionDef, Role};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model provider returned invalid response: {0}")]
    InvalidResponse(String),
    #[error("model provider did not respond within {0}ms")]
    Timeout(u64),
}

/// The model contract: given the full ordered history and the available
/// function definitions (possibly empty), produce the next assistant turn.
/// Any provider failure is a contract-level error, never a malformed turn.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(
        &self,
        history: &[ConversationTurn],
        tools: &[FunctionDef],
    ) -> Result<ConversationTurn, ModelError>;
}

/// Ollama-backed provider using the native `/api/chat` tool-call support.
#[derive(Clone)]
pub struct OllamaProvider {
    http: Client,
    base_url: String,
    model: String,
    system_prompt: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_client(base_url, model, Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        model: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            http: client,
            base_url: base_url.into(),
            model: model.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{trimmed}/{path}")
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    async fn generate(
        &self,
        history: &[ConversationTurn],
        tools: &[FunctionDef],
    ) -> Result<ConversationTurn, ModelError> {
        let url = self.endpoint("/api/chat");
        let payload = OllamaChatRequest::build(
            &self.model,
            self.system_prompt.as_deref(),
            history,
            tools,
        );
        info!(
            model = self.model.as_str(),
            url = %url,
            messages = payload.messages.len(),
            tools = payload.tools.len(),
            "sending request to model provider"
        );

        let response: OllamaChatResponse = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("received response from model provider");

        let message = response
            .message
            .ok_or_else(|| ModelError::InvalidResponse("missing message field".into()))?;
        turn_from_wire(message)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

impl OllamaChatRequest {
    fn build(
        model: &str,
        system_prompt: Option<&str>,
        history: &[ConversationTurn],
        tools: &[FunctionDef],
    ) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = system_prompt {
            messages.push(OllamaChatMessage {
                role: "system".to_string(),
                content: prompt.to_string(),
                tool_name: None,
                tool_calls: None,
            });
        }
        messages.extend(history.iter().map(message_from_turn));

        Self {
            model: model.to_string(),
            messages,
            tools: tools
                .iter()
                .map(|def| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": def.name,
                            "description": def.description,
                            "parameters": def.parameters,
                        }
                    })
                })
                .collect(),
            stream: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaChatMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaChatMessage>,
}

fn message_from_turn(turn: &ConversationTurn) -> OllamaChatMessage {
    match turn.role {
        Role::User => OllamaChatMessage {
            role: "user".to_string(),
            content: turn.content.clone().unwrap_or_default(),
            tool_name: None,
            tool_calls: None,
        },
        Role::Assistant => OllamaChatMessage {
            role: "assistant".to_string(),
            content: turn.content.clone().unwrap_or_default(),
            tool_name: None,
            tool_calls: turn.invocation.as_ref().map(|invocation| {
                vec![OllamaToolCall {
                    function: OllamaFunctionCall {
                        name: invocation.capability.clone(),
                        arguments: invocation.arguments.clone(),
                    },
                }]
            }),
        },
        Role::ToolResult => {
            let result = turn.result.as_ref();
            OllamaChatMessage {
                role: "tool".to_string(),
                content: result
                    .map(|result| render_payload(&result.payload))
                    .unwrap_or_default(),
                tool_name: result.map(|result| result.capability.clone()),
                tool_calls: None,
            }
        }
    }
}

fn render_payload(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn turn_from_wire(message: OllamaChatMessage) -> Result<ConversationTurn, ModelError> {
    if message.role != "assistant" {
        return Err(ModelError::InvalidResponse(format!(
            "unexpected role '{}' in response",
            message.role
        )));
    }

    if let Some(calls) = message.tool_calls {
        if calls.len() > 1 {
            warn!(
                count = calls.len(),
                "model emitted multiple tool calls; handling the first"
            );
        }
        if let Some(call) = calls.into_iter().next() {
            return Ok(ConversationTurn::assistant_invocation(
                call.function.name,
                call.function.arguments,
            ));
        }
    }

    Ok(ConversationTurn::assistant(message.content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_joins_paths_correctly() {
        let provider = OllamaProvider::new("http://localhost:11434/", "llama3");
        assert_eq!(
            provider.endpoint("/api/chat"),
            "http://localhost:11434/api/chat"
        );
    }

    #[test]
    fn request_conversion_preserves_turn_roles() {
        let history = vec![
            ConversationTurn::user("read my page"),
            ConversationTurn::assistant_invocation("notion_read", json!({"page_id": "p1"})),
            ConversationTurn::tool_result("notion_read", json!("page body")),
        ];
        let request = OllamaChatRequest::build("llama3", None, &history, &[]);

        let roles: Vec<_> = request
            .messages
            .iter()
            .map(|message| message.role.as_str())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "tool"]);

        let assistant = &request.messages[1];
        let calls = assistant.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].function.name, "notion_read");

        let tool = &request.messages[2];
        assert_eq!(tool.content, "page body");
        assert_eq!(tool.tool_name.as_deref(), Some("notion_read"));
    }

    #[test]
    fn function_defs_are_wrapped_for_the_wire() {
        let tools = vec![FunctionDef {
            name: "fs_read".to_string(),
            description: "Reads a file.".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let request = OllamaChatRequest::build("llama3", None, &[], &tools);
        assert_eq!(request.tools[0]["type"], "function");
        assert_eq!(request.tools[0]["function"]["name"], "fs_read");
    }

    #[test]
    fn system_prompt_leads_the_message_list() {
        let history = vec![ConversationTurn::user("hi")];
        let request =
            OllamaChatRequest::build("llama3", Some("You are terse."), &history, &[]);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[0].content, "You are terse.");
        assert_eq!(request.messages[1].role, "user");
    }

    #[test]
    fn assistant_tool_call_response_becomes_an_invocation_turn() {
        let message: OllamaChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [
                {"function": {"name": "notion_read", "arguments": {"page_id": "p1"}}}
            ]
        }))
        .expect("decode message");

        let turn = turn_from_wire(message).expect("turn");
        let invocation = turn.invocation.expect("invocation");
        assert_eq!(invocation.capability, "notion_read");
        assert_eq!(invocation.arguments["page_id"], "p1");
    }

    #[test]
    fn plain_text_response_becomes_a_text_turn() {
        let message: OllamaChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "all done"
        }))
        .expect("decode message");

        let turn = turn_from_wire(message).expect("turn");
        assert_eq!(turn.content.as_deref(), Some("all done"));
        assert!(turn.invocation.is_none());
    }

    #[test]
    fn non_assistant_role_is_an_invalid_response() {
        let message: OllamaChatMessage = serde_json::from_value(json!({
            "role": "system",
            "content": "nope"
        }))
        .expect("decode message");
        assert!(matches!(
            turn_from_wire(message),
            Err(ModelError::InvalidResponse(_))
        ));
    }
}
