use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info};

use chartflow_core::config::EngineConfig;
use chartflow_core::error::{ChartflowError, Result};
use chartflow_core::event::EventBus;
use chartflow_core::traits::Generator;
use chartflow_core::types::{RunEvent, RunId};

use crate::context::{mark_control, RunContext};
use crate::graph::{Flowchart, FlowchartDocument, Node, NodeClass, NodeKind};
use crate::protocol;
use crate::scheduler::{SpeculationStats, SpeculativeUnits};
use crate::state::{Claim, InstanceId, NodeOutput};
use crate::variables;

/// A decision taken on the execution path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub label: String,
    pub reasoning: String,
    pub next: String,
    pub fell_back: bool,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: RunId,
    /// Text produced by the terminal node.
    pub text: String,
    /// Structured results keyed by instance id (`node_iteration`), in path order.
    pub extracted: IndexMap<String, serde_json::Value>,
    /// Instances in the order the main traversal first reached them.
    pub path: Vec<InstanceId>,
    pub decisions: IndexMap<String, DecisionRecord>,
    pub stats: SpeculationStats,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Runs a flowchart against a generation collaborator.
///
/// The runner itself is immutable: each `run()` builds its own state, so one
/// runner can serve any number of concurrent runs.
pub struct FlowchartRunner {
    flowchart: Arc<Flowchart>,
    generator: Arc<dyn Generator>,
    system_prompt: String,
    config: EngineConfig,
    events: Option<Arc<EventBus>>,
}

impl FlowchartRunner {
    pub fn new(flowchart: impl Into<Arc<Flowchart>>, generator: Arc<dyn Generator>) -> Self {
        Self {
            flowchart: flowchart.into(),
            generator,
            system_prompt: String::new(),
            config: EngineConfig::default(),
            events: None,
        }
    }

    /// Validate a document and build a runner using its system prompt.
    pub fn from_document(document: &FlowchartDocument, generator: Arc<dyn Generator>) -> Result<Self> {
        Ok(Self::new(document.flowchart()?, generator).with_system_prompt(&document.system_prompt))
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_lookahead_depth(mut self, depth: usize) -> Self {
        self.config.lookahead_depth = depth;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn flowchart(&self) -> &Flowchart {
        &self.flowchart
    }

    /// Traverse the flowchart from its start node to a terminal node.
    ///
    /// Every speculative unit launched during the run has been joined by the
    /// time this returns, whether the run succeeded or not.
    pub async fn run(&self, initial_context: &str) -> Result<RunOutput> {
        let started = Instant::now();
        let started_at = Utc::now();
        let ctx = Arc::new(RunContext::new(
            Arc::clone(&self.flowchart),
            Arc::clone(&self.generator),
            protocol::compose_system_prompt(&self.system_prompt, &self.config.focus_instruction),
            initial_context.to_string(),
            self.events.clone(),
        ));

        info!(
            run_id = %ctx.run_id,
            start_node = %self.flowchart.start(),
            lookahead = self.config.lookahead_depth,
            "Flowchart run started"
        );
        ctx.publish(RunEvent::RunStarted {
            run_id: ctx.run_id,
            start_node: self.flowchart.start().to_string(),
            at: started_at,
        });

        let mut units = SpeculativeUnits::new();
        let outcome = self.traverse(&ctx, &mut units).await;
        units.join_all().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let stats = units.stats();
        ctx.publish(RunEvent::RunFinished {
            run_id: ctx.run_id,
            succeeded: outcome.is_ok(),
            elapsed_ms,
        });

        let text = match outcome {
            Ok(text) => text,
            Err(e) => {
                error!(run_id = %ctx.run_id, error = %e, elapsed_ms, "Flowchart run failed");
                return Err(e);
            }
        };

        let state = ctx.lock();
        let path = state.path().to_vec();
        let mut extracted = IndexMap::new();
        let mut decisions = IndexMap::new();
        for instance in &path {
            let Some(output) = state.result(instance) else {
                continue;
            };
            if let Some(value) = output.extracted() {
                extracted.insert(instance.to_string(), value.clone());
            }
            if let NodeOutput::Decision(decision) = output {
                decisions.insert(
                    instance.to_string(),
                    DecisionRecord {
                        label: decision.label.clone(),
                        reasoning: decision.reasoning.clone(),
                        next: decision.next.clone(),
                        fell_back: decision.fell_back,
                    },
                );
            }
        }

        info!(
            run_id = %ctx.run_id,
            steps = path.len(),
            launched = stats.launched,
            reused = stats.reused,
            elapsed_ms,
            "Flowchart run finished"
        );

        Ok(RunOutput {
            run_id: ctx.run_id,
            text,
            extracted,
            path,
            decisions,
            stats,
            started_at,
            elapsed_ms,
        })
    }

    async fn traverse(&self, ctx: &Arc<RunContext>, units: &mut SpeculativeUnits) -> Result<String> {
        let mut current = self.flowchart.start().to_string();

        loop {
            let node = self.flowchart.get(&current)?;
            let instance = {
                let mut state = ctx.lock();
                let instance = state.instance_for(&current);
                state.record_path(&instance);
                instance
            };
            debug!(instance = %instance, "Visiting node");

            current = match &node.kind {
                NodeKind::LoopStart { .. } => {
                    let info = self.flowchart.loop_started_by(&current)?;
                    let items = {
                        let mut state = ctx.lock();
                        mark_control(&mut state, &instance);
                        variables::enter_loop(info, &mut state)?
                    };
                    if items == 0 {
                        debug!(loop_start = %current, "Empty collection, skipping loop");
                        self.flowchart.loop_exit(info)?.to_string()
                    } else {
                        follow_single(&current, node)?
                    }
                }
                NodeKind::LoopContinue { .. } => {
                    let info = self.flowchart.loop_closed_by(&current)?;
                    let branch = {
                        let mut state = ctx.lock();
                        mark_control(&mut state, &instance);
                        variables::advance_loop(info, &mut state)?
                    };
                    node.connections
                        .get(branch.label())
                        .cloned()
                        .ok_or_else(|| ChartflowError::InvalidLoop {
                            node: current.clone(),
                            message: format!("missing '{}' connection", branch.label()),
                        })?
                }
                NodeKind::Basic => {
                    units.speculate(ctx, &current, self.config.lookahead_depth);
                    let output = self.obtain(ctx, units, &instance).await?;

                    match node.class() {
                        NodeClass::Terminal => {
                            return output
                                .text()
                                .map(str::to_string)
                                .ok_or(ChartflowError::TerminalNotText(current));
                        }
                        NodeClass::Transition => follow_single(&current, node)?,
                        NodeClass::Decision => match output {
                            NodeOutput::Decision(decision) => decision.next,
                            other => {
                                let value = other.extracted().cloned().unwrap_or_default();
                                protocol::resolve_decision(&current, &node.connections, value).next
                            }
                        },
                    }
                }
            };
        }
    }

    /// Result of `instance` for the main path: joined from a background
    /// unit, cached, or executed now. A failed background unit is re-raised;
    /// one launched with a prompt that has since changed is executed again.
    async fn obtain(
        &self,
        ctx: &Arc<RunContext>,
        units: &mut SpeculativeUnits,
        instance: &InstanceId,
    ) -> Result<NodeOutput> {
        if units.has(instance) {
            debug!(instance = %instance, "Joining speculative unit");
            if let Some(result) = units.join_one(ctx, instance).await {
                return result;
            }
        }

        let cached = ctx.lock().result(instance).cloned();
        if let Some(output) = cached {
            debug!(instance = %instance, "Reusing completed result");
            return Ok(output);
        }

        let request = {
            let mut state = ctx.lock();
            let claim = state.claim(instance);
            // Every claim is taken on this task and every launched unit was
            // joined above, so nothing else can be executing it.
            debug_assert!(claim != Claim::Pending, "instance {instance} claimed without a tracked unit");
            match claim {
                Claim::Cached(output) => return Ok(output),
                Claim::Pending => {
                    return Err(ChartflowError::InvalidState(format!(
                        "instance {instance} is claimed but has no unit to join"
                    )));
                }
                Claim::Claimed => match ctx.prepare(&state, instance) {
                    Ok(request) => request,
                    Err(e) => {
                        state.release(instance);
                        return Err(e);
                    }
                },
            }
        };

        ctx.perform(instance.clone(), request, false).await
    }
}

fn follow_single(current: &str, node: &Node) -> Result<String> {
    node.connections
        .values()
        .next()
        .cloned()
        .ok_or_else(|| ChartflowError::Config(format!("node '{current}' has no outgoing connection")))
}
