use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use chartflow_core::error::{ChartflowError, Result};

use super::node::{Node, NodeKind, COMPLETE, HAS_MORE};

/// A paired `LOOP_START` / `LOOP_CONTINUE` construct.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    /// Id of the `LOOP_START` node.
    pub start: String,
    /// Id of the `LOOP_CONTINUE` node that closes this loop.
    pub continue_node: String,
    pub iterator: String,
    pub collection: String,
    /// Node ids whose instances are renewed on every iteration, including the
    /// `LOOP_CONTINUE` node itself.
    pub body: IndexSet<String>,
}

/// An immutable, validated flowchart.
///
/// Validation happens once here, never per run, so a `Flowchart` can be
/// shared across any number of concurrent runs.
#[derive(Debug, Clone)]
pub struct Flowchart {
    nodes: IndexMap<String, Node>,
    start: String,
    loops: HashMap<String, LoopInfo>,
    continue_owner: HashMap<String, String>,
}

impl Flowchart {
    /// Validate and build a flowchart from its nodes.
    pub fn new(nodes: IndexMap<String, Node>) -> Result<Self> {
        for (id, node) in &nodes {
            for (label, target) in &node.connections {
                if !nodes.contains_key(target) {
                    return Err(ChartflowError::DanglingConnection {
                        from: id.clone(),
                        label: label.clone(),
                        to: target.clone(),
                    });
                }
            }
            if let Some(missing) = node.needs.iter().find(|n| !nodes.contains_key(*n)) {
                return Err(ChartflowError::UnknownNode(missing.clone()));
            }
        }

        let start = resolve_start_node(&nodes)?;
        let (loops, continue_owner) = pair_loops(&nodes)?;

        Ok(Self {
            nodes,
            start,
            loops,
            continue_owner,
        })
    }

    /// The unique node that is never a connection target.
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node, failing with a configuration error if absent.
    pub fn get(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| ChartflowError::UnknownNode(id.to_string()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Loop construct opened by the given `LOOP_START` node.
    pub fn loop_started_by(&self, start_id: &str) -> Result<&LoopInfo> {
        self.loops.get(start_id).ok_or_else(|| ChartflowError::InvalidLoop {
            node: start_id.to_string(),
            message: "not a LOOP_START node".into(),
        })
    }

    /// Loop construct closed by the given `LOOP_CONTINUE` node.
    pub fn loop_closed_by(&self, continue_id: &str) -> Result<&LoopInfo> {
        self.continue_owner
            .get(continue_id)
            .and_then(|start| self.loops.get(start))
            .ok_or_else(|| ChartflowError::InvalidLoop {
                node: continue_id.to_string(),
                message: "not a LOOP_CONTINUE node".into(),
            })
    }

    /// Target followed when a loop finishes, including when it never starts.
    pub fn loop_exit(&self, info: &LoopInfo) -> Result<&str> {
        self.get(&info.continue_node)?
            .connections
            .get(COMPLETE)
            .map(String::as_str)
            .ok_or_else(|| ChartflowError::InvalidLoop {
                node: info.continue_node.clone(),
                message: format!("missing '{COMPLETE}' connection"),
            })
    }
}

/// Find the unique start node: the only id that never appears as a connection value.
pub fn resolve_start_node(nodes: &IndexMap<String, Node>) -> Result<String> {
    let targets: HashSet<&str> = nodes
        .values()
        .flat_map(|n| n.connections.values().map(String::as_str))
        .collect();

    let candidates: Vec<String> = nodes
        .keys()
        .filter(|id| !targets.contains(id.as_str()))
        .cloned()
        .collect();

    match candidates.len() {
        0 => Err(ChartflowError::NoStartNode),
        1 => Ok(candidates.into_iter().next().unwrap_or_default()),
        _ => Err(ChartflowError::AmbiguousStartNode(candidates)),
    }
}

type LoopTables = (HashMap<String, LoopInfo>, HashMap<String, String>);

/// Pair every `LOOP_CONTINUE` with its `LOOP_START` and compute loop bodies.
fn pair_loops(nodes: &IndexMap<String, Node>) -> Result<LoopTables> {
    let starts: Vec<&String> = nodes
        .iter()
        .filter(|(_, n)| matches!(n.kind, NodeKind::LoopStart { .. }))
        .map(|(id, _)| id)
        .collect();

    let mut continue_owner = HashMap::new();
    for (id, node) in nodes {
        let NodeKind::LoopContinue { loop_start } = &node.kind else {
            continue;
        };
        let owner = match loop_start {
            Some(start) => match nodes.get(start).map(|n| &n.kind) {
                Some(NodeKind::LoopStart { .. }) => start.clone(),
                _ => {
                    return Err(ChartflowError::InvalidLoop {
                        node: id.clone(),
                        message: format!("'{start}' is not a LOOP_START node"),
                    })
                }
            },
            None if starts.len() == 1 => starts[0].clone(),
            None => {
                return Err(ChartflowError::InvalidLoop {
                    node: id.clone(),
                    message: format!(
                        "found {} LOOP_START nodes; set 'loop_start' to pick one",
                        starts.len()
                    ),
                })
            }
        };
        for label in [HAS_MORE, COMPLETE] {
            if !node.connections.contains_key(label) {
                return Err(ChartflowError::InvalidLoop {
                    node: id.clone(),
                    message: format!("missing '{label}' connection"),
                });
            }
        }
        continue_owner.insert(id.clone(), owner);
    }

    let mut loops = HashMap::new();
    for start in starts {
        let node = &nodes[start];
        let NodeKind::LoopStart {
            iterator,
            collection,
        } = &node.kind
        else {
            continue;
        };

        let closers: Vec<&String> = continue_owner
            .iter()
            .filter(|(_, owner)| *owner == start)
            .map(|(id, _)| id)
            .collect();
        let continue_node = match closers.as_slice() {
            [only] => (*only).clone(),
            _ => {
                return Err(ChartflowError::InvalidLoop {
                    node: start.clone(),
                    message: format!("expected exactly one LOOP_CONTINUE, found {}", closers.len()),
                })
            }
        };

        if node.connections.len() != 1 {
            return Err(ChartflowError::InvalidLoop {
                node: start.clone(),
                message: "LOOP_START must have exactly one connection".into(),
            });
        }

        let body = loop_body(nodes, start, &continue_node)?;
        loops.insert(
            start.clone(),
            LoopInfo {
                start: start.clone(),
                continue_node,
                iterator: iterator.clone(),
                collection: collection.clone(),
                body,
            },
        );
    }

    Ok((loops, continue_owner))
}

/// Nodes reachable from the loop entry without passing through the closing
/// `LOOP_CONTINUE`, plus that node.
fn loop_body(
    nodes: &IndexMap<String, Node>,
    start: &str,
    continue_node: &str,
) -> Result<IndexSet<String>> {
    let mut body = IndexSet::new();
    let mut queue: VecDeque<&str> = nodes[start].connections.values().map(String::as_str).collect();

    while let Some(id) = queue.pop_front() {
        if id == start || !body.insert(id.to_string()) {
            continue;
        }
        if id == continue_node {
            continue;
        }
        if let Some(node) = nodes.get(id) {
            queue.extend(node.connections.values().map(String::as_str));
        }
    }

    if !body.contains(continue_node) {
        return Err(ChartflowError::InvalidLoop {
            node: start.to_string(),
            message: format!("loop body never reaches '{continue_node}'"),
        });
    }
    Ok(body)
}

/// A flowchart as authored on disk: nodes plus the system prompt they run under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowchartDocument {
    #[serde(default)]
    pub system_prompt: String,
    pub nodes: IndexMap<String, Node>,
}

impl FlowchartDocument {
    /// Load a document from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ChartflowError::Config(e.to_string()))
    }

    /// Validate the nodes into a runnable flowchart.
    pub fn flowchart(&self) -> Result<Flowchart> {
        Flowchart::new(self.nodes.clone())
    }
}
