//! The phase pipeline definition.
//!
//! Phases are a closed set. Each variant declares its progress sub-range,
//! failure policy, and which prior outputs it consumes, so the orchestrator
//! never branches on phase names.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One ordered unit of analysis work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    ParseDocuments,
    ExtractTenderInfo,
    GenerateOnepager,
    AnalyzeScope,
    AnalyzeRfpSections,
    AssessIntelligence,
    AssessQuality,
    GenerateSummary,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::ParseDocuments,
        Phase::ExtractTenderInfo,
        Phase::GenerateOnepager,
        Phase::AnalyzeScope,
        Phase::AnalyzeRfpSections,
        Phase::AssessIntelligence,
        Phase::AssessQuality,
        Phase::GenerateSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::ParseDocuments => "parse-documents",
            Phase::ExtractTenderInfo => "extract-tender-info",
            Phase::GenerateOnepager => "generate-onepager",
            Phase::AnalyzeScope => "analyze-scope",
            Phase::AnalyzeRfpSections => "analyze-rfp-sections",
            Phase::AssessIntelligence => "assess-intelligence",
            Phase::AssessQuality => "assess-quality",
            Phase::GenerateSummary => "generate-summary",
        }
    }

    /// The standard spec for this phase.
    pub fn spec(self) -> PhaseSpec {
        use FailurePolicy::*;
        use Phase::*;
        let (start, end, policy, needs): (u8, u8, FailurePolicy, &'static [Phase]) = match self {
            ParseDocuments => (0, 20, Fatal, &[]),
            ExtractTenderInfo => (20, 35, Tolerant, &[ParseDocuments]),
            GenerateOnepager => (35, 50, Tolerant, &[ParseDocuments, ExtractTenderInfo]),
            AnalyzeScope => (50, 60, Tolerant, &[ParseDocuments, ExtractTenderInfo]),
            AnalyzeRfpSections => (60, 70, Tolerant, &[ParseDocuments]),
            AssessIntelligence => (
                70,
                85,
                Tolerant,
                &[ExtractTenderInfo, GenerateOnepager, AnalyzeScope, AnalyzeRfpSections],
            ),
            AssessQuality => (
                85,
                92,
                Tolerant,
                &[
                    ExtractTenderInfo,
                    GenerateOnepager,
                    AnalyzeScope,
                    AnalyzeRfpSections,
                    AssessIntelligence,
                ],
            ),
            GenerateSummary => (
                92,
                100,
                Tolerant,
                &[ExtractTenderInfo, GenerateOnepager, AssessIntelligence],
            ),
        };
        PhaseSpec {
            phase: self,
            start,
            end,
            policy,
            needs,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown phase: {s}")))
    }
}

/// What happens to the run when a phase's analyzer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Store a zero-confidence placeholder and keep going.
    Tolerant,
    /// Fail the whole analysis.
    Fatal,
}

/// Static definition of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    pub phase: Phase,
    /// Progress when the phase starts.
    pub start: u8,
    /// Progress once the phase is done (or degraded).
    pub end: u8,
    pub policy: FailurePolicy,
    /// Prior phases whose outputs are handed to this phase's analyzer.
    pub needs: &'static [Phase],
}

/// Ordered, validated list of phases. Immutable once built.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    specs: Vec<PhaseSpec>,
}

impl PhasePlan {
    /// The full tender analysis pipeline.
    pub fn standard() -> Self {
        Self {
            specs: Phase::ALL.into_iter().map(Phase::spec).collect(),
        }
    }

    /// Build a plan from explicit specs, rejecting inconsistent ones.
    pub fn new(specs: Vec<PhaseSpec>) -> Result<Self> {
        let plan = Self { specs };
        plan.validate()?;
        Ok(plan)
    }

    /// Ranges must be non-empty, ordered, non-overlapping, and within 0..=100.
    /// A phase may only consume outputs of phases that run before it.
    pub fn validate(&self) -> Result<()> {
        if self.specs.is_empty() {
            return Err(Error::Config("phase plan is empty".to_string()));
        }
        let mut floor = 0u8;
        for (i, spec) in self.specs.iter().enumerate() {
            if spec.start >= spec.end || spec.end > 100 {
                return Err(Error::Config(format!(
                    "phase {} has invalid range {}..{}",
                    spec.phase, spec.start, spec.end
                )));
            }
            if spec.start < floor {
                return Err(Error::Config(format!(
                    "phase {} overlaps the previous phase (starts at {}, previous ends at {floor})",
                    spec.phase, spec.start
                )));
            }
            if self.specs[..i].iter().any(|s| s.phase == spec.phase) {
                return Err(Error::Config(format!("phase {} listed twice", spec.phase)));
            }
            if let Some(missing) = spec
                .needs
                .iter()
                .find(|need| !self.specs[..i].iter().any(|s| s.phase == **need))
            {
                return Err(Error::Config(format!(
                    "phase {} needs {missing}, which does not run before it",
                    spec.phase
                )));
            }
            floor = spec.end;
        }
        Ok(())
    }

    pub fn specs(&self) -> &[PhaseSpec] {
        &self.specs
    }

    pub fn phases(&self) -> impl Iterator<Item = Phase> + '_ {
        self.specs.iter().map(|s| s.phase)
    }

    pub fn get(&self, phase: Phase) -> Option<&PhaseSpec> {
        self.specs.iter().find(|s| s.phase == phase)
    }
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self::standard()
    }
}
