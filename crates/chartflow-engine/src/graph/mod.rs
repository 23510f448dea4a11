//! Flowchart graph model.
//!
//! A flowchart is a mapping of node id to `Node`. Connections are labelled
//! edges; their count classifies each node as terminal, transition or
//! decision. `LOOP_START` / `LOOP_CONTINUE` pairs form the only cycles.
//!
//! All structural checks run once in `Flowchart::new`, so a validated
//! flowchart is read-only and can back any number of concurrent runs.

pub mod flowchart;
pub mod node;

pub use flowchart::{resolve_start_node, Flowchart, FlowchartDocument, LoopInfo};
pub use node::{classify, Node, NodeClass, NodeKind, COMPLETE, HAS_MORE};
