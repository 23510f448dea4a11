//! Building and sending the generation request for a node.
//!
//! Every node maps to exactly one request: free text, structured extraction
//! against its `output_schema`, or a decision (the schema extended with
//! `reasoning` and `decision`). Each request is one collaborator call with no
//! retry at this level.

use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::warn;

use chartflow_core::error::Result;
use chartflow_core::traits::Generator;
use chartflow_core::types::{StructuredRequest, TextRequest};

use crate::graph::{Node, NodeClass};
use crate::state::{DecisionOutcome, NodeOutput};

pub const REASONING_FIELD: &str = "reasoning";
pub const DECISION_FIELD: &str = "decision";

/// The single collaborator request issued for a node instance.
#[derive(Debug, Clone)]
pub enum NodeRequest {
    Text(TextRequest),
    Extract(StructuredRequest),
    Decide(StructuredRequest),
}

impl NodeRequest {
    pub fn prompt(&self) -> &str {
        match self {
            Self::Text(request) => &request.prompt,
            Self::Extract(request) | Self::Decide(request) => &request.prompt,
        }
    }
}

/// Prompt sent for a node: the run's initial context followed by the node text.
pub fn compose_prompt(initial_context: &str, node_text: &str) -> String {
    if initial_context.trim().is_empty() {
        return node_text.to_string();
    }
    format!("## Context\n\n{}\n\n---\n\n{}", initial_context, node_text)
}

/// Flowchart system prompt with the engine's focus instruction appended.
pub fn compose_system_prompt(system_prompt: &str, focus_instruction: &str) -> String {
    match (system_prompt.trim().is_empty(), focus_instruction.trim().is_empty()) {
        (true, _) => focus_instruction.to_string(),
        (false, true) => system_prompt.to_string(),
        (false, false) => format!("{}\n\n{}", system_prompt.trim_end(), focus_instruction),
    }
}

/// Choose the request kind for a node from its classification and schema.
pub fn build_request(node: &Node, prompt: String, system_prompt: String) -> NodeRequest {
    match (node.class(), &node.output_schema) {
        (NodeClass::Decision, schema) => {
            let labels: Vec<&str> = node.connections.keys().map(String::as_str).collect();
            NodeRequest::Decide(StructuredRequest {
                prompt,
                system_prompt,
                schema: decision_schema(schema.as_ref(), &labels),
            })
        }
        (_, Some(schema)) => NodeRequest::Extract(StructuredRequest {
            prompt,
            system_prompt,
            schema: schema.clone(),
        }),
        (_, None) => NodeRequest::Text(TextRequest {
            prompt,
            system_prompt,
            temperature: node.temperature,
        }),
    }
}

/// Extend `base` with required `reasoning` and `decision` fields.
///
/// The decision is constrained to the labels by description only; a label
/// outside the set is handled by `resolve_decision`.
pub fn decision_schema(base: Option<&Value>, labels: &[&str]) -> Value {
    let mut schema = match base {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({ "type": "object" }),
    };

    let Some(object) = schema.as_object_mut() else {
        return schema;
    };
    object.insert("type".into(), json!("object"));

    let properties = object
        .entry("properties")
        .or_insert_with(|| json!({}));
    if let Some(properties) = properties.as_object_mut() {
        properties.insert(
            REASONING_FIELD.into(),
            json!({
                "type": "string",
                "description": "Brief reasoning that leads to the decision."
            }),
        );
        properties.insert(
            DECISION_FIELD.into(),
            json!({
                "type": "string",
                "description": format!("The chosen branch. Must be exactly one of: {}", labels.join(", "))
            }),
        );
    }

    let required = object.entry("required").or_insert_with(|| json!([]));
    if let Some(required) = required.as_array_mut() {
        for field in [REASONING_FIELD, DECISION_FIELD] {
            if !required.iter().any(|r| r == field) {
                required.push(json!(field));
            }
        }
    }

    schema
}

/// Map a decision result onto a connection.
///
/// A label that matches no connection falls back to the first connection in
/// authored order.
pub fn resolve_decision(
    node_id: &str,
    connections: &IndexMap<String, String>,
    value: Value,
) -> DecisionOutcome {
    let label = value
        .get(DECISION_FIELD)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let reasoning = value
        .get(REASONING_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let (next, fell_back) = match connections.get(&label) {
        Some(target) => (target.clone(), false),
        None => {
            let first = connections.values().next().cloned().unwrap_or_default();
            warn!(
                node_id,
                returned = %label,
                fallback = %first,
                "Decision matched no connection, taking first connection"
            );
            (first, true)
        }
    };

    DecisionOutcome {
        value,
        label,
        reasoning,
        next,
        fell_back,
    }
}

/// Send the request and shape the response.
pub async fn execute(
    generator: &dyn Generator,
    node_id: &str,
    node: &Node,
    request: NodeRequest,
) -> Result<NodeOutput> {
    match request {
        NodeRequest::Text(request) => generator.generate_text(request).await.map(NodeOutput::Text),
        NodeRequest::Extract(request) => generator
            .generate_structured(request)
            .await
            .map(NodeOutput::Extracted),
        NodeRequest::Decide(request) => {
            let value = generator.generate_structured(request).await?;
            Ok(NodeOutput::Decision(resolve_decision(
                node_id,
                &node.connections,
                value,
            )))
        }
    }
}
