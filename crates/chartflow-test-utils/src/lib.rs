//! Shared test fixtures for Chartflow crates.
//!
//! `MockGenerator` answers generation requests from a script keyed by a
//! substring of the prompt, and counts every call so tests can assert on
//! memoization and speculative execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use chartflow_core::error::{ChartflowError, Result};
use chartflow_core::traits::Generator;
use chartflow_core::types::{StructuredRequest, TextRequest};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Structured(serde_json::Value),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Rule {
    key: String,
    reply: Reply,
    delay: Option<Duration>,
}

/// Scripted, call-counting generation collaborator.
///
/// Rules are matched in registration order; the first rule whose key occurs
/// in the prompt answers the call.
#[derive(Default)]
pub struct MockGenerator {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<HashMap<String, usize>>,
    prompts: Mutex<Vec<String>>,
    system_prompts: Mutex<Vec<String>>,
    total: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer prompts containing `key` with free text.
    pub fn text(self, key: impl Into<String>, reply: impl Into<String>) -> Self {
        self.push(key.into(), Reply::Text(reply.into()))
    }

    /// Answer prompts containing `key` with a structured value.
    pub fn structured(self, key: impl Into<String>, reply: serde_json::Value) -> Self {
        self.push(key.into(), Reply::Structured(reply))
    }

    /// Fail prompts containing `key` with a collaborator error.
    pub fn fail(self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.push(key.into(), Reply::Fail(message.into()))
    }

    /// Delay every reply for `key` (applies to the most recent rule with that key).
    pub fn delay(self, key: &str, delay: Duration) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            if let Some(rule) = rules.iter_mut().rev().find(|r| r.key == key) {
                rule.delay = Some(delay);
            }
        }
        self
    }

    fn push(self, key: String, reply: Reply) -> Self {
        self.rules.lock().unwrap().push(Rule {
            key,
            reply,
            delay: None,
        });
        self
    }

    /// Number of calls answered by the rule keyed `key`.
    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Total calls received, matched or not.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Calls currently suspended inside the mock.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously suspended calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every prompt received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn system_prompts(&self) -> Vec<String> {
        self.system_prompts.lock().unwrap().clone()
    }

    fn lookup(&self, prompt: &str) -> Option<Rule> {
        let rules = self.rules.lock().unwrap();
        rules.iter().find(|r| prompt.contains(&r.key)).cloned()
    }

    async fn answer(&self, prompt: String, system_prompt: String) -> Result<Reply> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        self.prompts.lock().unwrap().push(prompt.clone());
        self.system_prompts.lock().unwrap().push(system_prompt);

        let rule = self.lookup(&prompt).ok_or_else(|| {
            ChartflowError::GenerationRequest(format!("no scripted reply for prompt: {prompt}"))
        })?;
        *self.calls.lock().unwrap().entry(rule.key.clone()).or_insert(0) += 1;

        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }

        match rule.reply {
            Reply::Fail(message) => Err(ChartflowError::GenerationRequest(message)),
            reply => Ok(reply),
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Generator for MockGenerator {
    fn generate_text(&self, request: TextRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            match self.answer(request.prompt, request.system_prompt).await? {
                Reply::Text(text) => Ok(text),
                Reply::Structured(value) => Ok(value.to_string()),
                Reply::Fail(message) => Err(ChartflowError::GenerationRequest(message)),
            }
        })
    }

    fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            match self.answer(request.prompt, request.system_prompt).await? {
                Reply::Structured(value) => Ok(value),
                Reply::Text(text) => serde_json::from_str(&text)
                    .map_err(|e| ChartflowError::GenerationParse(e.to_string())),
                Reply::Fail(message) => Err(ChartflowError::GenerationRequest(message)),
            }
        })
    }
}
