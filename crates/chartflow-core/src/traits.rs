use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{StructuredRequest, TextRequest};

/// Generation collaborator consumed by the flowchart engine.
///
/// Both calls are single suspension points. Retries, backoff and model
/// selection belong to the implementation, never to the engine.
pub trait Generator: Send + Sync + 'static {
    /// Free-text generation at the requested temperature.
    fn generate_text(&self, request: TextRequest) -> BoxFuture<'_, Result<String>>;

    /// Generation constrained to `request.schema`. Returns the parsed JSON value.
    fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}
