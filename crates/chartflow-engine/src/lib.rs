//! Flowchart execution engine.
//!
//! A [`Flowchart`] is validated once and shared; every [`FlowchartRunner::run`]
//! walks it with its own state, executing one generation request per node
//! instance while nodes further ahead run speculatively in the background.

pub mod context;
pub mod executor;
pub mod graph;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod variables;

pub use context::RunContext;
pub use executor::{DecisionRecord, FlowchartRunner, RunOutput};
pub use graph::{
    classify, resolve_start_node, Flowchart, FlowchartDocument, LoopInfo, Node, NodeClass,
    NodeKind, COMPLETE, HAS_MORE,
};
pub use protocol::NodeRequest;
pub use scheduler::{lookahead, SpeculationStats, SpeculativeUnits};
pub use state::{Claim, DecisionOutcome, InstanceId, LoopState, NodeOutput, RunState};
pub use variables::{resolve_placeholders, LoopBranch};
