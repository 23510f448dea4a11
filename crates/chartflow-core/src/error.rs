use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartflowError {
    // Flowchart configuration errors
    #[error("Flowchart has no start node (every node is a connection target)")]
    NoStartNode,

    #[error("Flowchart has multiple start nodes: {}", .0.join(", "))]
    AmbiguousStartNode(Vec<String>),

    #[error("Connection '{label}' of node '{from}' targets unknown node '{to}'")]
    DanglingConnection {
        from: String,
        label: String,
        to: String,
    },

    #[error("Node not found in flowchart: {0}")]
    UnknownNode(String),

    #[error("Invalid loop construct at '{node}': {message}")]
    InvalidLoop { node: String, message: String },

    #[error("Unresolved placeholder '${{{name}}}' in node '{node}': no loop binding or prior extraction provides it")]
    UnresolvedPlaceholder { node: String, name: String },

    #[error("Loop collection error at '{node}': {message}")]
    LoopCollection { node: String, message: String },

    #[error("Terminal node '{0}' did not produce text")]
    TerminalNotText(String),

    // Generation collaborator errors
    #[error("Generation request failed: {0}")]
    GenerationRequest(String),

    #[error("Generation response parse error: {0}")]
    GenerationParse(String),

    #[error("Generation provider not supported: {0}")]
    UnsupportedProvider(String),

    // Engine runtime errors
    #[error("Background unit for '{instance}' did not complete: {message}")]
    BackgroundTask { instance: String, message: String },

    #[error("Invalid run state: {0}")]
    InvalidState(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChartflowError {
    /// Deterministic flowchart authoring errors. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoStartNode
                | Self::AmbiguousStartNode(_)
                | Self::DanglingConnection { .. }
                | Self::UnknownNode(_)
                | Self::InvalidLoop { .. }
                | Self::UnresolvedPlaceholder { .. }
                | Self::LoopCollection { .. }
                | Self::TerminalNotText(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChartflowError>;
