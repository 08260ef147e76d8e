//! Search phases, per-candidate records and the final outcome record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classification::Classification;
use crate::tensor::{DirectionTensor, ImageTensor};

/// Unique search invocation identifier.
pub type SearchId = Uuid;

/// Controller state machine.
///
/// `Init -> OriginalEval -> FeasibilityProbe -> {CoarseScan -> FineScan | Bisection}
/// -> Tighten -> Success`, with `ForcedFallback`, `Infeasible` and
/// `Interrupted` as the side exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchPhase {
    Init,
    OriginalEval,
    FeasibilityProbe,
    ForcedFallback,
    CoarseScan,
    FineScan,
    Bisection,
    Tighten,
    Success,
    Infeasible,
    Interrupted,
}

impl SearchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Infeasible | Self::Interrupted)
    }

    pub fn can_transition_to(&self, next: SearchPhase) -> bool {
        use SearchPhase::*;

        if !self.is_terminal() && next == Interrupted {
            return true;
        }
        matches!(
            (self, next),
            (Init, OriginalEval)
                | (OriginalEval, FeasibilityProbe)
                | (FeasibilityProbe, ForcedFallback)
                | (FeasibilityProbe, CoarseScan)
                | (FeasibilityProbe, Bisection)
                | (FeasibilityProbe, Success)
                | (FeasibilityProbe, Infeasible)
                | (ForcedFallback, Success)
                | (ForcedFallback, Infeasible)
                | (CoarseScan, FineScan)
                | (CoarseScan, Infeasible)
                | (FineScan, Tighten)
                | (FineScan, Success)
                | (Bisection, Tighten)
                | (Bisection, Success)
                | (Bisection, Infeasible)
                | (Tighten, Success)
        )
    }
}

impl std::fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::OriginalEval => "ORIGINAL_EVAL",
            Self::FeasibilityProbe => "FEASIBILITY_PROBE",
            Self::ForcedFallback => "FORCED_FALLBACK",
            Self::CoarseScan => "COARSE_SCAN",
            Self::FineScan => "FINE_SCAN",
            Self::Bisection => "BISECTION",
            Self::Tighten => "TIGHTEN",
            Self::Success => "SUCCESS",
            Self::Infeasible => "INFEASIBLE",
            Self::Interrupted => "INTERRUPTED",
        };
        f.write_str(name)
    }
}

/// How a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// A reliable flip was found inside the configured range.
    Success,
    /// Only the forced large-epsilon retry flipped the label.
    ForcedSuccess,
    /// No tested epsilon satisfied the success policy.
    Infeasible,
    /// The budget or a cancellation stopped the search early.
    Interrupted,
}

/// One classified (or failed) candidate epsilon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub epsilon: f64,
    pub phase: SearchPhase,
    pub classification: Option<Classification>,
    pub error: Option<String>,
    /// Whether the candidate met the success policy.
    pub succeeded: bool,
}

/// Everything a caller needs to render or persist a finished search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub id: SearchId,
    pub verdict: Verdict,
    pub success: bool,
    /// Epsilon of the attached adversarial tensor.
    pub epsilon_used: f64,
    pub original: Classification,
    /// `None` only when every candidate evaluation failed.
    pub adversarial: Option<Classification>,
    pub original_image: ImageTensor,
    pub direction: DirectionTensor,
    pub adversarial_image: ImageTensor,
    pub evaluations: Vec<CandidateRecord>,
    /// Number of perturbed candidates sent to the classifier.
    pub iterations: usize,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SearchOutcome {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Tensor-free view for transport and logging.
    pub fn summary(&self) -> SearchSummary {
        SearchSummary {
            id: self.id,
            verdict: self.verdict,
            success: self.success,
            epsilon_used: self.epsilon_used,
            original: self.original.clone(),
            adversarial: self.adversarial.clone(),
            iterations: self.iterations,
            warnings: self.warnings.clone(),
            duration_ms: self.duration_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub id: SearchId,
    pub verdict: Verdict,
    pub success: bool,
    pub epsilon_used: f64,
    pub original: Classification,
    pub adversarial: Option<Classification>,
    pub iterations: usize,
    pub warnings: Vec<String>,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use SearchPhase::*;
        let path = [Init, OriginalEval, FeasibilityProbe, CoarseScan, FineScan, Tighten, Success];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        use SearchPhase::*;
        for terminal in [Success, Infeasible, Interrupted] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Interrupted));
            assert!(!terminal.can_transition_to(CoarseScan));
        }
    }

    #[test]
    fn fine_scan_cannot_report_infeasible() {
        // A fine scan always has a successful anchor to fall back on.
        assert!(!SearchPhase::FineScan.can_transition_to(SearchPhase::Infeasible));
        assert!(!SearchPhase::Init.can_transition_to(SearchPhase::CoarseScan));
    }

    #[test]
    fn any_live_phase_can_be_interrupted() {
        use SearchPhase::*;
        for phase in [Init, OriginalEval, FeasibilityProbe, ForcedFallback, CoarseScan, FineScan, Bisection, Tighten] {
            assert!(phase.can_transition_to(Interrupted));
        }
    }

    #[test]
    fn phase_display_matches_state_names() {
        assert_eq!(SearchPhase::FeasibilityProbe.to_string(), "FEASIBILITY_PROBE");
    }
}
