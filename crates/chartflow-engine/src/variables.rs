//! Placeholder substitution and loop bookkeeping.
//!
//! `${name}` resolves to the active loop binding first, then to the nearest
//! earlier instance on the execution path whose extracted result has a field
//! called `name`. An unresolved placeholder is an authoring error and fails
//! the run; the literal token is never sent to the collaborator.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use chartflow_core::error::{ChartflowError, Result};

use crate::graph::{LoopInfo, COMPLETE, HAS_MORE};
use crate::state::{LoopState, RunState};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_\-]*)\s*\}").expect("placeholder pattern is valid")
    })
}

/// Distinct placeholder names in `text`, in order of first appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder_pattern().captures_iter(text) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Current value for `name`, if anything provides it.
pub fn lookup<'a>(name: &str, state: &'a RunState) -> Option<&'a serde_json::Value> {
    if let Some(bound) = state.binding(name) {
        return Some(bound);
    }
    state
        .path()
        .iter()
        .rev()
        .filter_map(|id| state.result(id).and_then(|r| r.extracted()))
        .find_map(|value| value.get(name))
}

/// True when every placeholder in `text` can be resolved right now.
pub fn can_resolve(text: &str, state: &RunState) -> bool {
    placeholders(text)
        .iter()
        .all(|name| lookup(name, state).is_some())
}

/// Substitute every placeholder in `text`.
pub fn resolve_placeholders(node_id: &str, text: &str, state: &RunState) -> Result<String> {
    let pattern = placeholder_pattern();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in pattern.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(name.as_str(), state).ok_or_else(|| {
            ChartflowError::UnresolvedPlaceholder {
                node: node_id.to_string(),
                name: name.as_str().to_string(),
            }
        })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&display(value));
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expose `collection[index]` under `iterator`.
pub fn bind_loop_variable(
    iterator: &str,
    collection: &[serde_json::Value],
    index: usize,
    state: &mut RunState,
) {
    match collection.get(index) {
        Some(item) => {
            state.bindings.insert(iterator.to_string(), item.clone());
        }
        None => {
            state.bindings.remove(iterator);
        }
    }
}

/// Bind the loop collection on first entry into a `LOOP_START`.
///
/// The collection is read from the extraction of the instance immediately
/// before the current one on the execution path. Re-entry for a known
/// iterator leaves the loop untouched. Returns the number of items.
pub fn enter_loop(info: &LoopInfo, state: &mut RunState) -> Result<usize> {
    if let Some(existing) = state.loop_state(&info.iterator) {
        return Ok(existing.collection.len());
    }

    let path = state.path();
    let previous = path
        .len()
        .checked_sub(2)
        .and_then(|i| path.get(i))
        .ok_or_else(|| ChartflowError::LoopCollection {
            node: info.start.clone(),
            message: "no node precedes the loop on the execution path".into(),
        })?;

    let extracted = state
        .result(previous)
        .and_then(|r| r.extracted())
        .ok_or_else(|| ChartflowError::LoopCollection {
            node: info.start.clone(),
            message: format!("preceding node '{previous}' has no extracted result"),
        })?;

    let collection = extracted
        .get(&info.collection)
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| ChartflowError::LoopCollection {
            node: info.start.clone(),
            message: format!(
                "field '{}' on '{previous}' is missing or not a list",
                info.collection
            ),
        })?;

    debug!(
        loop_start = %info.start,
        iterator = %info.iterator,
        items = collection.len(),
        "Entering loop"
    );

    let len = collection.len();
    bind_loop_variable(&info.iterator, &collection, 0, state);
    state.loops.insert(
        info.iterator.clone(),
        LoopState {
            collection,
            index: 0,
            processed: Default::default(),
        },
    );
    Ok(len)
}

/// Branch taken by a `LOOP_CONTINUE` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBranch {
    HasMore,
    Complete,
}

impl LoopBranch {
    pub fn label(self) -> &'static str {
        match self {
            Self::HasMore => HAS_MORE,
            Self::Complete => COMPLETE,
        }
    }
}

/// Move a loop to its next item.
///
/// On `HasMore` the loop variable is rebound and every body node gets a
/// fresh iteration index. On `Complete` the binding is removed.
pub fn advance_loop(info: &LoopInfo, state: &mut RunState) -> Result<LoopBranch> {
    let loop_state = state
        .loops
        .get_mut(&info.iterator)
        .ok_or_else(|| ChartflowError::LoopCollection {
            node: info.continue_node.clone(),
            message: format!("loop '{}' was never entered", info.start),
        })?;

    let finished = loop_state.index;
    loop_state.processed.insert(finished);
    loop_state.index += 1;

    if let Some(item) = loop_state.current().cloned() {
        let index = loop_state.index;
        state.bindings.insert(info.iterator.clone(), item);
        state.bump_iterations(&info.body);
        debug!(iterator = %info.iterator, index, "Loop has more items");
        Ok(LoopBranch::HasMore)
    } else {
        state.bindings.remove(&info.iterator);
        debug!(iterator = %info.iterator, processed = finished + 1, "Loop complete");
        Ok(LoopBranch::Complete)
    }
}
