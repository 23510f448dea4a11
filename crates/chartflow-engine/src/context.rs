use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::debug;

use chartflow_core::error::Result;
use chartflow_core::event::EventBus;
use chartflow_core::traits::Generator;
use chartflow_core::types::{RunEvent, RunId};

use crate::graph::Flowchart;
use crate::protocol::{self, NodeRequest};
use crate::state::{Claim, InstanceId, NodeOutput, RunState};
use crate::variables;

/// Everything one `run()` shares with its speculative units.
///
/// The flowchart and generator are shared with other runs; the `RunState`
/// belongs to this run alone. The state lock is never held across a
/// generation call.
pub struct RunContext {
    pub run_id: RunId,
    pub flowchart: Arc<Flowchart>,
    generator: Arc<dyn Generator>,
    system_prompt: String,
    initial_context: String,
    state: Mutex<RunState>,
    events: Option<Arc<EventBus>>,
}

impl RunContext {
    pub fn new(
        flowchart: Arc<Flowchart>,
        generator: Arc<dyn Generator>,
        system_prompt: String,
        initial_context: String,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            flowchart,
            generator,
            system_prompt,
            initial_context,
            state: Mutex::new(RunState::new()),
            events,
        }
    }

    /// Lock the run state. A panic in another unit does not poison the run.
    pub fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Resolve the node's prompt against the current state and build its request.
    pub fn prepare(&self, state: &RunState, instance: &InstanceId) -> Result<NodeRequest> {
        let node = self.flowchart.get(&instance.node_id)?;
        let text = variables::resolve_placeholders(&instance.node_id, &node.text, state)?;
        let prompt = protocol::compose_prompt(&self.initial_context, &text);
        Ok(protocol::build_request(node, prompt, self.system_prompt.clone()))
    }

    /// Whether `prompt` is still what the instance would be sent now.
    /// The instance's own result takes no part in resolving its prompt.
    pub fn prompt_is_current(&self, state: &mut RunState, instance: &InstanceId, prompt: &str) -> bool {
        state.without_result(instance, |state| {
            self.prepare(state, instance)
                .map(|request| request.prompt() == prompt)
                .unwrap_or(false)
        })
    }

    /// Execute a claimed instance and record its outcome.
    ///
    /// On success the result is stored (first writer wins) and the stored
    /// value is returned. On failure the claim is released so the instance
    /// counts as unvisited again.
    pub async fn perform(
        &self,
        instance: InstanceId,
        request: NodeRequest,
        speculative: bool,
    ) -> Result<NodeOutput> {
        let label = instance.to_string();
        self.publish(RunEvent::NodeStarted {
            run_id: self.run_id,
            instance: label.clone(),
            speculative,
        });
        debug!(instance = %label, speculative, "Executing node");

        let started = Instant::now();
        let outcome = match self.flowchart.get(&instance.node_id) {
            Ok(node) => {
                protocol::execute(self.generator.as_ref(), &instance.node_id, node, request).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => {
                if let NodeOutput::Decision(decision) = &output {
                    if decision.fell_back {
                        self.publish(RunEvent::DecisionFallback {
                            run_id: self.run_id,
                            instance: label.clone(),
                            returned: decision.label.clone(),
                            chosen: decision.next.clone(),
                        });
                    }
                }

                let stored = {
                    let mut state = self.lock();
                    if state.complete(&instance, output.clone()) {
                        output
                    } else {
                        state.result(&instance).cloned().unwrap_or(output)
                    }
                };

                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(instance = %label, speculative, elapsed_ms, "Node completed");
                self.publish(RunEvent::NodeCompleted {
                    run_id: self.run_id,
                    instance: label,
                    speculative,
                    elapsed_ms,
                });
                Ok(stored)
            }
            Err(e) => {
                self.lock().release(&instance);
                debug!(instance = %label, speculative, error = %e, "Node failed");
                self.publish(RunEvent::NodeFailed {
                    run_id: self.run_id,
                    instance: label,
                    speculative,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// Complete a loop-control instance without a collaborator call.
pub fn mark_control(state: &mut RunState, instance: &InstanceId) {
    if matches!(state.claim(instance), Claim::Claimed) {
        state.complete(instance, NodeOutput::Control);
    }
}
