use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::variables;

/// Label a `LOOP_CONTINUE` node follows while items remain.
pub const HAS_MORE: &str = "HasMore";
/// Label a `LOOP_CONTINUE` node follows once the collection is exhausted.
pub const COMPLETE: &str = "Complete";

/// A named step in a flowchart.
///
/// `text` is a prompt template that may contain `${name}` placeholders.
/// The number of `connections` decides how the step behaves: none makes it
/// terminal, one makes it a transition, more makes it a decision whose
/// branch the collaborator picks by label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub text: String,
    pub kind: NodeKind,
    /// Outcome label to target node id, in authored order.
    pub connections: IndexMap<String, String>,
    /// JSON Schema for constrained extraction.
    pub output_schema: Option<serde_json::Value>,
    /// Sampling temperature for unconstrained text generation.
    pub temperature: f32,
    /// Node ids that must already have been visited before speculative execution.
    pub needs: Vec<String>,
}

/// State-machine tag of a node. Loop attributes only exist on the variants
/// that use them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Basic,
    LoopStart {
        /// Loop variable name exposed to placeholders.
        iterator: String,
        /// Field on the preceding node's extraction holding the sequence.
        collection: String,
    },
    LoopContinue {
        /// Owning `LOOP_START`; may be omitted when the flowchart has a single loop.
        loop_start: Option<String>,
    },
}

impl NodeKind {
    pub fn is_loop_control(&self) -> bool {
        !matches!(self, Self::Basic)
    }
}

/// Classification by connection count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Terminal,
    Transition,
    Decision,
}

fn default_temperature() -> f32 {
    0.7
}

impl Node {
    /// Create a basic node with the given prompt template.
    pub fn basic(text: impl Into<String>) -> Self {
        Self::with_kind(text.into(), NodeKind::Basic)
    }

    /// Create a `LOOP_START` node iterating `collection` as `iterator`.
    pub fn loop_start(iterator: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::with_kind(
            String::new(),
            NodeKind::LoopStart {
                iterator: iterator.into(),
                collection: collection.into(),
            },
        )
    }

    /// Create a `LOOP_CONTINUE` node.
    pub fn loop_continue() -> Self {
        Self::with_kind(String::new(), NodeKind::LoopContinue { loop_start: None })
    }

    fn with_kind(text: String, kind: NodeKind) -> Self {
        Self {
            text,
            kind,
            connections: IndexMap::new(),
            output_schema: None,
            temperature: default_temperature(),
            needs: vec![],
        }
    }

    /// Add an outgoing connection.
    pub fn connect(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        self.connections.insert(label.into(), target.into());
        self
    }

    /// Set the output schema.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the prerequisite node ids.
    pub fn with_needs(mut self, needs: Vec<String>) -> Self {
        self.needs = needs;
        self
    }

    /// Bind a `LOOP_CONTINUE` node to its `LOOP_START`. No effect on other kinds.
    pub fn with_loop_start(mut self, start: impl Into<String>) -> Self {
        if let NodeKind::LoopContinue { loop_start } = &mut self.kind {
            *loop_start = Some(start.into());
        }
        self
    }

    pub fn class(&self) -> NodeClass {
        classify(self)
    }

    /// Placeholder names referenced by the prompt template.
    pub fn placeholders(&self) -> Vec<String> {
        variables::placeholders(&self.text)
    }
}

/// Classify a node purely from its connection count.
pub fn classify(node: &Node) -> NodeClass {
    match node.connections.len() {
        0 => NodeClass::Terminal,
        1 => NodeClass::Transition,
        _ => NodeClass::Decision,
    }
}

/// Authoring shape of a node as it appears in flowchart documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    #[serde(default)]
    text: String,
    #[serde(rename = "type", default)]
    node_type: RawNodeType,
    #[serde(default)]
    connections: IndexMap<String, String>,
    #[serde(default, alias = "outputSchema", skip_serializing_if = "Option::is_none")]
    output_schema: Option<serde_json::Value>,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection: Option<String>,
    #[serde(default, alias = "loopStart", skip_serializing_if = "Option::is_none")]
    loop_start: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RawNodeType {
    #[default]
    Basic,
    LoopStart,
    LoopContinue,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let kind = match raw.node_type {
            RawNodeType::Basic => NodeKind::Basic,
            RawNodeType::LoopStart => NodeKind::LoopStart {
                iterator: raw
                    .iterator
                    .ok_or("LOOP_START node requires an 'iterator' field")?,
                collection: raw
                    .collection
                    .ok_or("LOOP_START node requires a 'collection' field")?,
            },
            RawNodeType::LoopContinue => NodeKind::LoopContinue {
                loop_start: raw.loop_start,
            },
        };

        Ok(Self {
            text: raw.text,
            kind,
            connections: raw.connections,
            output_schema: raw.output_schema,
            temperature: raw.temperature,
            needs: raw.needs,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let (node_type, iterator, collection, loop_start) = match node.kind {
            NodeKind::Basic => (RawNodeType::Basic, None, None, None),
            NodeKind::LoopStart {
                iterator,
                collection,
            } => (RawNodeType::LoopStart, Some(iterator), Some(collection), None),
            NodeKind::LoopContinue { loop_start } => {
                (RawNodeType::LoopContinue, None, None, loop_start)
            }
        };

        Self {
            text: node.text,
            node_type,
            connections: node.connections,
            output_schema: node.output_schema,
            temperature: node.temperature,
            needs: node.needs,
            iterator,
            collection,
            loop_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_builder() {
        let node = Node::basic("Ask about ${topic}")
            .connect("Yes", "b")
            .connect("No", "c")
            .with_temperature(0.2)
            .with_needs(vec!["intro".into()]);

        assert_eq!(node.kind, NodeKind::Basic);
        assert_eq!(node.temperature, 0.2);
        assert_eq!(node.needs, vec!["intro"]);
        assert_eq!(node.class(), NodeClass::Decision);
        assert_eq!(node.placeholders(), vec!["topic"]);
    }

    #[test]
    fn test_classification_by_connection_count() {
        assert_eq!(Node::basic("end").class(), NodeClass::Terminal);
        assert_eq!(Node::basic("step").connect("next", "b").class(), NodeClass::Transition);
        assert_eq!(
            Node::basic("pick").connect("a", "x").connect("b", "y").class(),
            NodeClass::Decision
        );
    }

    #[test]
    fn test_deserialize_defaults_to_basic() {
        let node: Node = serde_json::from_value(json!({
            "text": "Hello",
            "connections": {"next": "b"}
        }))
        .unwrap();
        assert_eq!(node.kind, NodeKind::Basic);
        assert_eq!(node.temperature, 0.7);
        assert!(node.output_schema.is_none());
    }

    #[test]
    fn test_deserialize_loop_start() {
        let node: Node = serde_json::from_value(json!({
            "type": "LOOP_START",
            "iterator": "item",
            "collection": "items",
            "connections": {"body": "work"}
        }))
        .unwrap();
        assert_eq!(
            node.kind,
            NodeKind::LoopStart {
                iterator: "item".into(),
                collection: "items".into()
            }
        );
        assert!(node.kind.is_loop_control());
    }

    #[test]
    fn test_loop_start_requires_iterator() {
        let err = serde_json::from_value::<Node>(json!({
            "type": "LOOP_START",
            "collection": "items"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("iterator"));
    }

    #[test]
    fn test_camel_case_schema_alias() {
        let node: Node = serde_json::from_value(json!({
            "text": "Extract",
            "outputSchema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(node.output_schema, Some(json!({"type": "object"})));
    }

    #[test]
    fn test_connection_order_preserved() {
        let node: Node = serde_json::from_str(
            r#"{"text": "pick", "connections": {"Zeta": "z", "Alpha": "a", "Mid": "m"}}"#,
        )
        .unwrap();
        let labels: Vec<&str> = node.connections.keys().map(String::as_str).collect();
        assert_eq!(labels, vec!["Zeta", "Alpha", "Mid"]);
    }

    #[test]
    fn test_serialization_roundtrip_keeps_kind() {
        let node = Node::loop_continue()
            .with_loop_start("each")
            .connect(HAS_MORE, "each")
            .connect(COMPLETE, "done");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "LOOP_CONTINUE");
        let parsed: Node = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }
}
