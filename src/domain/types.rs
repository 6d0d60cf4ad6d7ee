use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool_result",
        }
    }
}

/// A capability invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub capability: String,
    pub arguments: Value,
}

/// The payload a backend produced for an invocation, tagged with the
/// capability it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub capability: String,
    pub payload: Value,
}

/// One entry in the ordered exchange between user, model, and tool results.
///
/// The history is append-only and replayed verbatim to the model on every
/// turn; a `ToolResult` turn must immediately follow the `Assistant` turn
/// whose invocation request names the same capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation: Option<InvocationRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<InvocationResult>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            invocation: None,
            result: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            invocation: None,
            result: None,
        }
    }

    pub fn assistant_invocation(capability: impl Into<String>, arguments: Value) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            invocation: Some(InvocationRequest {
                capability: capability.into(),
                arguments,
            }),
            result: None,
        }
    }

    pub fn tool_result(capability: impl Into<String>, payload: Value) -> Self {
        Self {
            role: Role::ToolResult,
            content: None,
            invocation: None,
            result: Some(InvocationResult {
                capability: capability.into(),
                payload,
            }),
        }
    }

    /// True when this turn is the tool result answering `previous`'s
    /// invocation request.
    pub fn answers(&self, previous: &ConversationTurn) -> bool {
        match (&self.result, &previous.invocation) {
            (Some(result), Some(request)) => {
                self.role == Role::ToolResult
                    && previous.role == Role::Assistant
                    && result.capability == request.capability
            }
            _ => false,
        }
    }
}

/// A protocol-native capability description as listed by a backend. The
/// parameter schema is opaque here and passed through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub parameter_schema: Option<Value>,
}

/// The function-definition shape handed to the model contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
