use crate::model::{ModelError, ModelProvider};
use crate::registry::CapabilityRegistry;
use crate::schema;
use crate::types::{ConversationTurn, FunctionDef};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;
const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("model contract failed: {0}")]
    Model(#[from] ModelError),
    #[error("model kept requesting invocations after {rounds} tool rounds")]
    ToolLoopExhausted { rounds: usize },
}

/// One executed capability invocation within a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStep {
    pub capability: String,
    pub arguments: Value,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub conversation_id: String,
    pub response: String,
    pub steps: Vec<ToolStep>,
    pub turns: Vec<ConversationTurn>,
}

/// Owns the turn-by-turn loop between the model contract and the capability
/// registry. Each `process_message` call runs one conversation to a terminal
/// state; concurrent conversations each call with their own history, sharing
/// only the read-only registry.
pub struct Orchestrator<P: ModelProvider> {
    provider: P,
    registry: Arc<CapabilityRegistry>,
    max_tool_rounds: usize,
    model_timeout: Duration,
}

impl<P: ModelProvider> Orchestrator<P> {
    pub fn new(provider: P, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            provider,
            registry,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Runs one conversation: the user turn is appended, the model queried
    /// with the full history and capability schemas, and any requested
    /// invocation executed and fed back until the model answers in text or
    /// the tool-round budget runs out. Invocation failures become ordinary
    /// `tool_result` turns; only model-contract failures are fatal here.
    pub async fn process_message(
        &self,
        prompt: impl Into<String>,
    ) -> Result<ChatOutcome, OrchestratorError> {
        let conversation_id = Uuid::new_v4().to_string();
        let tools: Vec<FunctionDef> = self
            .registry
            .descriptors()
            .iter()
            .map(schema::to_function_def)
            .collect();
        info!(
            conversation_id = conversation_id.as_str(),
            capabilities = tools.len(),
            "conversation started"
        );

        let mut history = vec![ConversationTurn::user(prompt)];
        let mut steps: Vec<ToolStep> = Vec::new();

        loop {
            let reply = self.query_model(&history, &tools).await?;

            let Some((capability, arguments)) = schema::from_model_call(&reply) else {
                let response = reply.content.clone().unwrap_or_default();
                history.push(reply);
                info!(
                    conversation_id = conversation_id.as_str(),
                    tool_rounds = steps.len(),
                    "conversation reached final answer"
                );
                return Ok(ChatOutcome {
                    conversation_id,
                    response,
                    steps,
                    turns: history,
                });
            };

            if steps.len() == self.max_tool_rounds {
                warn!(
                    conversation_id = conversation_id.as_str(),
                    rounds = self.max_tool_rounds,
                    "tool-round budget exhausted"
                );
                return Err(OrchestratorError::ToolLoopExhausted {
                    rounds: self.max_tool_rounds,
                });
            }

            // Invocation-request turn first, then its result: the ordering
            // invariant the history replays to the model.
            history.push(reply);
            info!(
                conversation_id = conversation_id.as_str(),
                capability = capability.as_str(),
                "model requested capability invocation"
            );
            let payload = self.registry.invoke(&capability, arguments.clone()).await;
            debug!(
                conversation_id = conversation_id.as_str(),
                capability = capability.as_str(),
                "invocation payload appended"
            );
            steps.push(ToolStep {
                capability: capability.clone(),
                arguments,
                payload: payload.clone(),
            });
            history.push(ConversationTurn::tool_result(capability, payload));
        }
    }

    async fn query_model(
        &self,
        history: &[ConversationTurn],
        tools: &[FunctionDef],
    ) -> Result<ConversationTurn, OrchestratorError> {
        match timeout(self.model_timeout, self.provider.generate(history, tools)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(OrchestratorError::Model(ModelError::Timeout(
                self.model_timeout.as_millis() as u64,
            ))),
        }
    }
}
