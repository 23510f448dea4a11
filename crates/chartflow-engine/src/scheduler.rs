//! Speculative execution of nodes ahead of the main traversal.
//!
//! From the node the run is currently waiting on, a breadth-first walk
//! collects nearby nodes whose inputs are already known and launches each as
//! a background task. Tasks are never cancelled; their handles are kept so
//! the run can join them before it returns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chartflow_core::error::{ChartflowError, Result};

use crate::context::RunContext;
use crate::graph::{Flowchart, Node, NodeClass};
use crate::protocol::{DECISION_FIELD, REASONING_FIELD};
use crate::state::{Claim, InstanceId, NodeOutput, RunState};
use crate::variables;

/// Counters describing a run's speculative work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeculationStats {
    /// Background units started.
    pub launched: usize,
    /// Background units awaited, whatever their outcome.
    pub joined: usize,
    /// Main-path instances served by a background unit.
    pub reused: usize,
    /// Background failures the main path never needed.
    pub discarded_failures: usize,
    /// Background results dropped because their prompt changed before the
    /// main path reached them.
    pub stale: usize,
}

/// Instances worth launching ahead of `current`, nearest first.
///
/// A candidate must be unvisited, must not be loop control, must have every
/// `needs` id visited and every placeholder resolvable now. A placeholder is
/// also held back when a node still pending on any walk from `current` to
/// the candidate may produce the same field. Launched units are revalidated
/// when joined, so this only avoids wasted work.
pub fn lookahead(
    flowchart: &Flowchart,
    current: &str,
    depth: usize,
    state: &RunState,
) -> Vec<InstanceId> {
    let mut candidates = Vec::new();
    let Some(origin) = flowchart.node(current) else {
        return candidates;
    };
    if depth == 0 || origin.kind.is_loop_control() {
        return candidates;
    }

    // Hop distance, discovery order, and the fields pending on arrival,
    // merged over every walk within `depth`.
    let mut hops: HashMap<&str, usize> = HashMap::from([(current, 0)]);
    let mut order: Vec<&str> = Vec::new();
    let mut arriving: HashMap<&str, Pending> = HashMap::new();
    let mut queue: VecDeque<&str> = VecDeque::from([current]);

    while let Some(id) = queue.pop_front() {
        let distance = hops.get(id).copied().unwrap_or(depth);
        if distance >= depth {
            continue;
        }
        let Some(node) = flowchart.node(id) else {
            continue;
        };
        let mut leaving = if id == current {
            Pending::default()
        } else {
            arriving.get(id).cloned().unwrap_or_default()
        };
        leaving.add(node);

        for target in node.connections.values() {
            let target = target.as_str();
            if target == current {
                continue;
            }
            match flowchart.node(target) {
                Some(next) if !next.kind.is_loop_control() => {}
                _ => continue,
            }
            let first = !hops.contains_key(target);
            if first {
                hops.insert(target, distance + 1);
                order.push(target);
            }
            let grew = arriving.entry(target).or_default().merge(&leaving);
            if first || grew {
                queue.push_back(target);
            }
        }
    }

    for id in order {
        let Some(node) = flowchart.node(id) else {
            continue;
        };
        let instance = state.instance_for(id);
        let pending = arriving.get(id).cloned().unwrap_or_default();
        let eligible = !state.is_visited(&instance)
            && !state.is_completed(&instance)
            && node.needs.iter().all(|n| state.has_visited_node(n))
            && inputs_ready(node, state, &pending);
        if eligible {
            candidates.push(instance);
        }
    }

    candidates
}

fn inputs_ready(node: &Node, state: &RunState, pending: &Pending) -> bool {
    variables::can_resolve(&node.text, state)
        && node
            .placeholders()
            .iter()
            .all(|name| state.binding(name).is_some() || !pending.may_produce(name))
}

/// Fields that nodes not yet executed may still produce.
#[derive(Debug, Clone, Default)]
struct Pending {
    fields: HashSet<String>,
    /// Some pending node extracts with a schema that lists no properties.
    opaque: bool,
}

impl Pending {
    fn add(&mut self, node: &Node) {
        if node.class() == NodeClass::Decision {
            self.fields.insert(REASONING_FIELD.to_string());
            self.fields.insert(DECISION_FIELD.to_string());
        }
        let Some(schema) = &node.output_schema else {
            return;
        };
        match schema.get("properties").and_then(|p| p.as_object()) {
            Some(properties) => self.fields.extend(properties.keys().cloned()),
            None => self.opaque = true,
        }
    }

    /// Union `other` into `self`; true when anything was added.
    fn merge(&mut self, other: &Pending) -> bool {
        let before = (self.fields.len(), self.opaque);
        self.fields.extend(other.fields.iter().cloned());
        self.opaque |= other.opaque;
        before != (self.fields.len(), self.opaque)
    }

    fn may_produce(&self, name: &str) -> bool {
        self.opaque || self.fields.contains(name)
    }
}

/// Handles of every background unit launched during one run.
#[derive(Default)]
pub struct SpeculativeUnits {
    handles: HashMap<InstanceId, Unit>,
    stats: SpeculationStats,
}

struct Unit {
    handle: JoinHandle<Result<NodeOutput>>,
    /// Prompt the unit was launched with.
    prompt: String,
}

impl SpeculativeUnits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch background units for every eligible instance near `current`.
    /// Returns how many were started.
    pub fn speculate(&mut self, ctx: &Arc<RunContext>, current: &str, depth: usize) -> usize {
        let launches = {
            let mut state = ctx.lock();
            let mut launches = Vec::new();
            for instance in lookahead(&ctx.flowchart, current, depth, &state) {
                if self.handles.contains_key(&instance)
                    || !matches!(state.claim(&instance), Claim::Claimed)
                {
                    continue;
                }
                match ctx.prepare(&state, &instance) {
                    Ok(request) => launches.push((instance, request)),
                    Err(e) => {
                        debug!(instance = %instance, error = %e, "Skipping speculative launch");
                        state.release(&instance);
                    }
                }
            }
            launches
        };

        let count = launches.len();
        for (instance, request) in launches {
            debug!(instance = %instance, from = current, "Launching speculative unit");
            let unit_ctx = Arc::clone(ctx);
            let unit_instance = instance.clone();
            let prompt = request.prompt().to_string();
            let handle =
                tokio::spawn(async move { unit_ctx.perform(unit_instance, request, true).await });
            self.handles.insert(instance, Unit { handle, prompt });
            self.stats.launched += 1;
        }
        count
    }

    /// Whether a background unit for `instance` is still outstanding.
    pub fn has(&self, instance: &InstanceId) -> bool {
        self.handles.contains_key(instance)
    }

    /// Await the unit for `instance` on behalf of the main path.
    ///
    /// Its failure is re-raised to the caller. Returns `None` when there is
    /// no unit, or when the prompt the unit ran with no longer matches what
    /// the instance resolves to now; a stale result is dropped from the run
    /// state so the caller executes the instance itself.
    pub async fn join_one(
        &mut self,
        ctx: &RunContext,
        instance: &InstanceId,
    ) -> Option<Result<NodeOutput>> {
        let Unit { handle, prompt } = self.handles.remove(instance)?;
        self.stats.joined += 1;
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ChartflowError::BackgroundTask {
                instance: instance.to_string(),
                message: e.to_string(),
            }),
        };

        {
            let mut state = ctx.lock();
            if !ctx.prompt_is_current(&mut state, instance, &prompt) {
                state.invalidate(instance);
                self.stats.stale += 1;
                debug!(instance = %instance, "Inputs changed since launch, dropping speculative result");
                return None;
            }
        }

        if result.is_ok() {
            self.stats.reused += 1;
        }
        Some(result)
    }

    /// Await every outstanding unit. Failures are logged and discarded.
    pub async fn join_all(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let (instances, handles): (Vec<_>, Vec<_>) =
            self.handles.drain().map(|(id, unit)| (id, unit.handle)).unzip();
        let results = join_all(handles).await;

        for (instance, result) in instances.into_iter().zip(results) {
            self.stats.joined += 1;
            let error = match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            self.stats.discarded_failures += 1;
            warn!(instance = %instance, error = %error, "Discarding failed speculative unit");
        }
    }

    pub fn outstanding(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> SpeculationStats {
        self.stats
    }
}
