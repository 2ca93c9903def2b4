//! Prompt book: per-phase instructions for the LLM-backed analyzer.
//!
//! Built-in defaults cover every LLM phase; a TOML file can override any of
//! them:
//!
//! ```toml
//! [[prompt]]
//! phase = "analyze-scope"
//! system = "You are a civil works estimator."
//! instruction = "List the work items and deliverables."
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::phase::Phase;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PromptFile {
    #[serde(default)]
    prompt: Vec<PhasePrompt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhasePrompt {
    pub phase: Phase,
    pub system: String,
    pub instruction: String,
}

const SYSTEM: &str = "You analyze public tender documents for a bidding team. \
Answer only from the provided context. Respond with a single JSON object of the form \
{\"output\": <your answer as JSON>, \"confidence\": <number between 0 and 1>}.";

/// Prompts indexed by phase.
#[derive(Debug, Clone)]
pub struct PromptBook {
    prompts: HashMap<Phase, PhasePrompt>,
}

impl PromptBook {
    /// The built-in prompts.
    pub fn defaults() -> Self {
        let instructions: [(Phase, &str); 7] = [
            (
                Phase::ExtractTenderInfo,
                "Extract the tender's key facts: authority, tender number, title, location, \
                 estimated value, EMD, document fees, bid submission and opening dates.",
            ),
            (
                Phase::GenerateOnepager,
                "Write a one-page brief: project overview, eligibility highlights, important \
                 dates, financial requirements, and a short risk summary.",
            ),
            (
                Phase::AnalyzeScope,
                "Describe the scope of work: work items with quantities where given, \
                 deliverables, and the expected effort or duration.",
            ),
            (
                Phase::AnalyzeRfpSections,
                "Break the RFP into its sections. For each, give a title, a summary, the \
                 requirements it imposes, and page references if present. List documents \
                 the RFP asks for that appear to be missing.",
            ),
            (
                Phase::AssessIntelligence,
                "Assess the bid: strengths, weaknesses, opportunities, threats, key risks \
                 with severity, compliance gaps, cost drivers, and a win probability estimate.",
            ),
            (
                Phase::AssessQuality,
                "Rate the completeness and consistency of the prior analysis outputs. Flag \
                 fields that are missing, contradictory, or low confidence.",
            ),
            (
                Phase::GenerateSummary,
                "Summarize the tender for a decision maker: title, overview, and at most \
                 seven key points.",
            ),
        ];
        let prompts = instructions
            .into_iter()
            .map(|(phase, instruction)| {
                (
                    phase,
                    PhasePrompt {
                        phase,
                        system: SYSTEM.to_string(),
                        instruction: instruction.to_string(),
                    },
                )
            })
            .collect();
        Self { prompts }
    }

    /// Defaults overlaid with the prompts from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read prompts {}: {e}", path.display())))?;
        Self::defaults().overlay_toml(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("bad prompts {}: {msg}", path.display())),
            other => other,
        })
    }

    fn overlay_toml(mut self, content: &str) -> Result<Self> {
        let file: PromptFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        for prompt in file.prompt {
            self.prompts.insert(prompt.phase, prompt);
        }
        Ok(self)
    }

    pub fn get(&self, phase: Phase) -> Option<&PhasePrompt> {
        self.prompts.get(&phase)
    }

    /// Phases this book has prompts for.
    pub fn phases(&self) -> impl Iterator<Item = Phase> + '_ {
        self.prompts.keys().copied()
    }
}

impl Default for PromptBook {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_phase_but_parsing() {
        let book = PromptBook::defaults();
        for phase in Phase::ALL {
            assert_eq!(
                book.get(phase).is_some(),
                phase != Phase::ParseDocuments,
                "{phase}"
            );
        }
    }

    #[test]
    fn toml_overrides_a_single_phase() {
        let book = PromptBook::defaults()
            .overlay_toml(
                r#"
                [[prompt]]
                phase = "analyze-scope"
                system = "estimator"
                instruction = "list items"
                "#,
            )
            .unwrap();
        assert_eq!(book.get(Phase::AnalyzeScope).unwrap().system, "estimator");
        assert_eq!(
            book.get(Phase::GenerateSummary).unwrap().system,
            PromptBook::defaults().get(Phase::GenerateSummary).unwrap().system
        );
    }

    #[test]
    fn unknown_phase_is_a_config_error() {
        let err = PromptBook::defaults()
            .overlay_toml("[[prompt]]\nphase = \"dance\"\nsystem = \"x\"\ninstruction = \"y\"\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
