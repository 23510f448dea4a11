use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chartflow_core::config::ModelConfig;
use chartflow_core::error::{ChartflowError, Result};
use chartflow_core::traits::Generator;
use chartflow_core::types::{StructuredRequest, TextRequest};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible generator. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiGenerator {
    http: Client,
    config: ModelConfig,
}

impl OpenAiGenerator {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    async fn complete(&self, body: ChatRequest) -> Result<String> {
        let base_url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

        let mut req = self.http.post(base_url).json(&body);
        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| ChartflowError::GenerationRequest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(ChartflowError::GenerationRequest(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ChartflowError::GenerationParse(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                input_tokens = usage.prompt_tokens,
                output_tokens = usage.completion_tokens,
                "Generation usage"
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ChartflowError::GenerationParse("response has no content".into()))
    }

    fn messages(system_prompt: String, prompt: String) -> Vec<OaiMessage> {
        vec![
            OaiMessage {
                role: "system".to_string(),
                content: system_prompt,
            },
            OaiMessage {
                role: "user".to_string(),
                content: prompt,
            },
        ]
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl Generator for OpenAiGenerator {
    fn generate_text(&self, request: TextRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: self.config.model_id.clone(),
                messages: Self::messages(request.system_prompt, request.prompt),
                max_tokens: self.config.max_tokens,
                temperature: Some(request.temperature),
                response_format: None,
            };
            self.complete(body).await
        })
    }

    fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: self.config.model_id.clone(),
                messages: Self::messages(request.system_prompt, request.prompt),
                max_tokens: self.config.max_tokens,
                temperature: None,
                response_format: Some(ResponseFormat {
                    r#type: "json_schema".to_string(),
                    json_schema: JsonSchemaFormat {
                        name: "node_result".to_string(),
                        schema: request.schema,
                        strict: false,
                    },
                }),
            };
            let text = self.complete(body).await?;
            parse_structured(&text)
        })
    }
}

/// Parse a structured reply, tolerating markdown code fences around the JSON.
pub(crate) fn parse_structured(text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(extract_json(text))
        .map_err(|e| ChartflowError::GenerationParse(format!("{}: {}", e, text)))
}

/// Extract JSON from a response that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            return &trimmed[start..=end];
        }
    }
    trimmed
}
