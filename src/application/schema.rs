use crate::types::{CapabilityDescriptor, ConversationTurn, FunctionDef};
use serde_json::{Value, json};

/// Converts a capability description into the function-definition shape the
/// model contract consumes. Pure: a missing description becomes an empty
/// string, a missing parameter schema an empty-object schema, never an error.
pub fn to_function_def(descriptor: &CapabilityDescriptor) -> FunctionDef {
    FunctionDef {
        name: descriptor.name.clone(),
        description: descriptor.description.clone().unwrap_or_default(),
        parameters: descriptor
            .parameter_schema
            .clone()
            .unwrap_or_else(empty_object_schema),
    }
}

pub fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// The sole parsing boundary between model vocabulary and capability
/// vocabulary: extracts the invocation request from a model reply, or `None`
/// when the reply is a plain text answer. Null arguments normalize to `{}`.
pub fn from_model_call(turn: &ConversationTurn) -> Option<(String, Value)> {
    let invocation = turn.invocation.as_ref()?;
    let arguments = match &invocation.arguments {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    Some((invocation.capability.clone(), arguments))
}
