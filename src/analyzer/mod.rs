//! Analyzer capabilities.
//!
//! Each phase is bound to exactly one [`Analyzer`] when the orchestrator is
//! built. Swapping a backend means injecting a different implementation,
//! never flipping a global switch.

pub mod documents;
pub mod llm;
pub mod prompts;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::phase::{Phase, PhasePlan};

pub use documents::DocumentAnalyzer;
pub use llm::{AnthropicCompletion, Completion, PromptAnalyzer, UnavailableCompletion};
pub use prompts::{PhasePrompt, PromptBook};

/// What an analyzer gets to work with.
#[derive(Debug, Clone)]
pub struct PhaseInput {
    pub subject: String,
    pub phase: Phase,
    /// Outputs of the prior phases this phase declared it needs.
    pub prior: BTreeMap<Phase, serde_json::Value>,
}

/// What an analyzer hands back on success.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutput {
    pub output: serde_json::Value,
    /// Clamped to [0, 1] by [`PhaseOutput::new`].
    pub confidence: f64,
}

impl PhaseOutput {
    pub fn new(output: serde_json::Value, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { output, confidence }
    }
}

/// Typed failure of an analyzer call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyzerError {
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Retryable backend failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The input cannot be analyzed. Never retried.
    #[error("unusable input: {0}")]
    FatalInput(String),

    /// The backend answered but the answer could not be used.
    #[error("malformed output: {0}")]
    Malformed(String),
}

impl AnalyzerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AnalyzerError::FatalInput(_))
    }
}

/// A capability that performs one phase's analysis.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze `input`, finishing within `deadline`.
    async fn analyze(
        &self,
        input: &PhaseInput,
        deadline: Duration,
    ) -> std::result::Result<PhaseOutput, AnalyzerError>;
}

/// Phase -> analyzer binding, fixed at construction.
#[derive(Clone, Default)]
pub struct AnalyzerSet {
    bindings: HashMap<Phase, Arc<dyn Analyzer>>,
}

impl AnalyzerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `analyzer` to `phase`, replacing any previous binding.
    pub fn bind(mut self, phase: Phase, analyzer: Arc<dyn Analyzer>) -> Self {
        self.bindings.insert(phase, analyzer);
        self
    }

    /// Bind the same analyzer to several phases.
    pub fn bind_all(
        mut self,
        phases: impl IntoIterator<Item = Phase>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        for phase in phases {
            self.bindings.insert(phase, Arc::clone(&analyzer));
        }
        self
    }

    pub fn get(&self, phase: Phase) -> Option<&Arc<dyn Analyzer>> {
        self.bindings.get(&phase)
    }

    /// The standard bindings: documents parse the first phase, prompts serve
    /// the rest.
    pub fn standard(documents: DocumentAnalyzer, prompts: PromptAnalyzer) -> Self {
        let llm_phases = prompts.phases();
        Self::new()
            .bind(Phase::ParseDocuments, Arc::new(documents))
            .bind_all(llm_phases, Arc::new(prompts))
    }

    /// Every phase of `plan` must have an analyzer.
    pub fn check_covers(&self, plan: &PhasePlan) -> Result<()> {
        let missing: Vec<String> = plan
            .phases()
            .filter(|p| !self.bindings.contains_key(p))
            .map(|p| p.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "no analyzer bound for phase(s): {}",
                missing.join(", ")
            )))
        }
    }
}
