pub mod providers;
pub mod retry;

use chartflow_core::config::ModelConfig;
use chartflow_core::error::{ChartflowError, Result};
use chartflow_core::traits::Generator;

pub use providers::openai::OpenAiGenerator;
pub use retry::RetryingGenerator;

/// Providers that speak the OpenAI chat-completions protocol.
const OPENAI_COMPATIBLE: &[&str] = &[
    "openai",
    "ollama",
    "vllm",
    "groq",
    "together",
    "openrouter",
    "lmstudio",
];

/// Create a generator based on the provider name, wrapped with retries when configured.
pub fn create_generator(config: &ModelConfig) -> Result<Box<dyn Generator>> {
    let provider = config.provider.to_lowercase();
    if !OPENAI_COMPATIBLE.contains(&provider.as_str()) {
        return Err(ChartflowError::UnsupportedProvider(config.provider.clone()));
    }

    let base: Box<dyn Generator> = Box::new(OpenAiGenerator::new(config.clone()));
    Ok(match &config.retry {
        Some(retry) => Box::new(RetryingGenerator::new(base, retry.clone())),
        None => base,
    })
}
