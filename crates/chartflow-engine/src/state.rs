use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime identity of one execution of a node: `(node_id, iteration)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub node_id: String,
    pub iteration: usize,
}

impl InstanceId {
    pub fn new(node_id: impl Into<String>, iteration: usize) -> Self {
        Self {
            node_id: node_id.into(),
            iteration,
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.node_id, self.iteration)
    }
}

/// A resolved branch decision.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    /// Full structured result, including `reasoning` and `decision`.
    pub value: serde_json::Value,
    /// Label returned by the collaborator.
    pub label: String,
    pub reasoning: String,
    /// Target node id actually chosen.
    pub next: String,
    /// True when `label` matched no connection and the first connection was taken.
    pub fell_back: bool,
}

/// Result of executing a node instance.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    Text(String),
    Extracted(serde_json::Value),
    Decision(DecisionOutcome),
    /// Loop-control nodes complete without a collaborator call.
    Control,
}

impl NodeOutput {
    /// Structured value exposed to placeholder resolution and callers.
    pub fn extracted(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Extracted(value) => Some(value),
            Self::Decision(outcome) => Some(&outcome.value),
            _ => None,
        }
    }

    /// Text-shaped result, as required of terminal nodes.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Extracted(serde_json::Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

/// Bookkeeping for one loop, keyed by its iterator name.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub collection: Vec<serde_json::Value>,
    pub index: usize,
    pub processed: BTreeSet<usize>,
}

impl LoopState {
    pub fn current(&self) -> Option<&serde_json::Value> {
        self.collection.get(self.index)
    }
}

/// Outcome of trying to take ownership of an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Already completed; reuse the stored output.
    Cached(NodeOutput),
    /// Someone else is executing it right now.
    Pending,
    /// The caller now owns execution and must `complete` or `release` it.
    Claimed,
}

/// All mutable state of a single `run()`.
///
/// Exclusive to one run. Shared with that run's speculative units behind a
/// mutex; every check-then-mark sequence happens under one lock acquisition.
#[derive(Debug, Default)]
pub struct RunState {
    visited: HashSet<InstanceId>,
    visited_nodes: HashMap<String, usize>,
    results: HashMap<InstanceId, NodeOutput>,
    pub(crate) loops: HashMap<String, LoopState>,
    pub(crate) bindings: HashMap<String, serde_json::Value>,
    iterations: HashMap<String, usize>,
    path: Vec<InstanceId>,
    on_path: HashSet<InstanceId>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance id the next visit of `node_id` gets.
    pub fn instance_for(&self, node_id: &str) -> InstanceId {
        InstanceId::new(node_id, self.iterations.get(node_id).copied().unwrap_or(0))
    }

    /// Give every listed node a fresh instance id on its next visit.
    pub fn bump_iterations<'a>(&mut self, node_ids: impl IntoIterator<Item = &'a String>) {
        for id in node_ids {
            *self.iterations.entry(id.clone()).or_insert(0) += 1;
        }
    }

    /// Append to the execution path if this instance has not been reached before.
    pub fn record_path(&mut self, id: &InstanceId) -> bool {
        if self.on_path.insert(id.clone()) {
            self.path.push(id.clone());
            true
        } else {
            false
        }
    }

    pub fn path(&self) -> &[InstanceId] {
        &self.path
    }

    pub fn claim(&mut self, id: &InstanceId) -> Claim {
        if let Some(output) = self.results.get(id) {
            return Claim::Cached(output.clone());
        }
        if self.visited.contains(id) {
            return Claim::Pending;
        }
        self.mark_visited(id);
        Claim::Claimed
    }

    /// Store the result of a claimed instance. First writer wins; later
    /// writes are rejected and reported as `false`.
    pub fn complete(&mut self, id: &InstanceId, output: NodeOutput) -> bool {
        if self.results.contains_key(id) {
            warn!(instance = %id, "Ignoring duplicate completion");
            return false;
        }
        self.mark_visited(id);
        self.results.insert(id.clone(), output);
        true
    }

    /// Drop a claim after a failed execution so the instance counts as unvisited.
    pub fn release(&mut self, id: &InstanceId) {
        if self.results.contains_key(id) {
            return;
        }
        self.unmark_visited(id);
    }

    /// Forget a completed result whose inputs have changed since it was
    /// produced. The instance counts as unvisited again.
    pub fn invalidate(&mut self, id: &InstanceId) -> bool {
        if self.results.remove(id).is_none() {
            return false;
        }
        self.unmark_visited(id);
        true
    }

    fn unmark_visited(&mut self, id: &InstanceId) {
        if !self.visited.remove(id) {
            return;
        }
        if let Some(count) = self.visited_nodes.get_mut(&id.node_id) {
            *count -= 1;
            if *count == 0 {
                self.visited_nodes.remove(&id.node_id);
            }
        }
    }

    fn mark_visited(&mut self, id: &InstanceId) {
        if self.visited.insert(id.clone()) {
            *self.visited_nodes.entry(id.node_id.clone()).or_insert(0) += 1;
        }
    }

    pub fn is_visited(&self, id: &InstanceId) -> bool {
        self.visited.contains(id)
    }

    pub fn is_completed(&self, id: &InstanceId) -> bool {
        self.results.contains_key(id)
    }

    /// Whether any instance of `node_id` has been visited.
    pub fn has_visited_node(&self, node_id: &str) -> bool {
        self.visited_nodes.contains_key(node_id)
    }

    pub fn result(&self, id: &InstanceId) -> Option<&NodeOutput> {
        self.results.get(id)
    }

    /// Evaluate `f` with the result of `id` hidden, as the state looked
    /// before `id` executed.
    pub fn without_result<T>(&mut self, id: &InstanceId, f: impl FnOnce(&RunState) -> T) -> T {
        let own = self.results.remove(id);
        let value = f(self);
        if let Some(output) = own {
            self.results.insert(id.clone(), output);
        }
        value
    }

    pub fn loop_state(&self, iterator: &str) -> Option<&LoopState> {
        self.loops.get(iterator)
    }

    pub fn binding(&self, name: &str) -> Option<&serde_json::Value> {
        self.bindings.get(name)
    }
}
