//! LLM-backed analysis via rig-core.
//!
//! [`PromptAnalyzer`] renders the phase's prompt with prior outputs as
//! context, asks a [`Completion`] backend, and parses the
//! `{"output": …, "confidence": …}` answer.

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::{ExposeSecret, SecretString};
use tracing::{Instrument, debug};

use super::prompts::PromptBook;
use super::{Analyzer, AnalyzerError, PhaseInput, PhaseOutput};
use crate::phase::Phase;
use crate::telemetry::genai::{record_error, start_chat_span};

/// Upper bound on the JSON context handed to the model.
const MAX_CONTEXT_CHARS: usize = 60_000;

/// A text completion backend.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AnalyzerError>;
}

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// Anthropic models through rig-core.
pub struct AnthropicCompletion {
    client: rig::providers::anthropic::Client,
    model: String,
    max_tokens: u64,
}

impl AnthropicCompletion {
    pub fn new(api_key: &SecretString, model: impl Into<String>) -> crate::error::Result<Self> {
        let client = anthropic_client(api_key).map_err(|e| {
            crate::error::Error::Config(format!("cannot build anthropic client: {e}"))
        })?;
        Ok(Self {
            client,
            model: model.into(),
            max_tokens: 4096,
        })
    }
}

#[async_trait]
impl Completion for AnthropicCompletion {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AnalyzerError> {
        let span = start_chat_span(&self.model, "anthropic", self.max_tokens);
        let agent = self
            .client
            .agent(&self.model)
            .preamble(system)
            .max_tokens(self.max_tokens)
            .build();
        agent
            .prompt(prompt)
            .into_future()
            .instrument(span.clone())
            .await
            .map_err(|e| {
                record_error(&span, "completion");
                AnalyzerError::Transient(e.to_string())
            })
    }
}

/// Stand-in when no LLM credentials are configured. Every call fails
/// transiently, so tolerant phases degrade instead of aborting the run.
pub struct UnavailableCompletion;

#[async_trait]
impl Completion for UnavailableCompletion {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, AnalyzerError> {
        Err(AnalyzerError::Transient(
            "no LLM backend configured".to_string(),
        ))
    }
}

/// Analyzer for the LLM phases.
pub struct PromptAnalyzer {
    completion: Arc<dyn Completion>,
    book: PromptBook,
}

impl PromptAnalyzer {
    pub fn new(completion: Arc<dyn Completion>, book: PromptBook) -> Self {
        Self { completion, book }
    }

    /// Phases this analyzer can serve.
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases: Vec<Phase> = self.book.phases().collect();
        phases.sort();
        phases
    }

    fn render(&self, input: &PhaseInput, instruction: &str) -> String {
        let context = render_context(&input.prior);
        format!(
            "{instruction}\n\nTender reference: {}\n\nContext from earlier analysis (JSON):\n{context}",
            input.subject
        )
    }
}

#[async_trait]
impl Analyzer for PromptAnalyzer {
    async fn analyze(
        &self,
        input: &PhaseInput,
        _deadline: Duration,
    ) -> Result<PhaseOutput, AnalyzerError> {
        let prompt = self.book.get(input.phase).ok_or_else(|| {
            AnalyzerError::FatalInput(format!("no prompt for phase {}", input.phase))
        })?;
        let text = self.render(input, &prompt.instruction);
        let answer = self.completion.complete(&prompt.system, &text).await?;
        debug!(phase = %input.phase, chars = answer.len(), "completion received");
        parse_answer(&answer)
    }
}

fn render_context(prior: &BTreeMap<Phase, serde_json::Value>) -> String {
    let mut context = serde_json::to_string_pretty(prior).unwrap_or_default();
    if context.len() > MAX_CONTEXT_CHARS {
        let mut cut = MAX_CONTEXT_CHARS;
        while !context.is_char_boundary(cut) {
            cut -= 1;
        }
        context.truncate(cut);
        context.push_str("\n…[truncated]");
    }
    context
}

/// Pull the `{"output", "confidence"}` object out of a model answer, which
/// may wrap it in prose or a code fence.
fn parse_answer(answer: &str) -> Result<PhaseOutput, AnalyzerError> {
    let start = answer.find('{');
    let end = answer.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(AnalyzerError::Malformed("no JSON object in answer".to_string()));
    };
    if end < start {
        return Err(AnalyzerError::Malformed("no JSON object in answer".to_string()));
    }
    let value: serde_json::Value = serde_json::from_str(&answer[start..=end])
        .map_err(|e| AnalyzerError::Malformed(e.to_string()))?;
    let output = value
        .get("output")
        .cloned()
        .ok_or_else(|| AnalyzerError::Malformed("answer has no `output`".to_string()))?;
    let confidence = value
        .get("confidence")
        .and_then(|c| c.as_f64())
        .ok_or_else(|| AnalyzerError::Malformed("answer has no numeric `confidence`".to_string()))?;
    Ok(PhaseOutput::new(output, confidence))
}
