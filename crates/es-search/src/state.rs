//! Mutable state owned by a single search invocation.

use es_types::{CandidateRecord, Classification, ImageTensor, SearchError, SearchPhase};
use std::collections::HashMap;

/// One candidate epsilon with the perturbed tensor and its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub epsilon: f64,
    pub image: ImageTensor,
    pub classification: Option<Classification>,
    pub error: Option<String>,
    pub succeeded: bool,
}

impl Evaluation {
    /// Ordering key for "closer to success" among failed candidates: a flipped
    /// label beats an unflipped one; flipped candidates rank by adversarial
    /// confidence, unflipped ones by how little confidence the original label kept.
    fn closeness(&self, original: &Classification) -> Option<(u8, f64)> {
        let c = self.classification.as_ref()?;
        Some(if c.differs_from(original) {
            (1, c.confidence)
        } else {
            (0, -c.confidence)
        })
    }

    /// Whichever of `a` and `b` came closer to a reliable flip. Ties keep `a`.
    pub fn closer_to_success(a: Evaluation, b: Evaluation, original: &Classification) -> Evaluation {
        match (a.closeness(original), b.closeness(original)) {
            (None, Some(_)) => b,
            (Some(ka), Some(kb)) if kb > ka => b,
            _ => a,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    classification: Option<Classification>,
    error: Option<String>,
    succeeded: bool,
}

/// Bounds, best success so far and the evaluation trace of one search.
///
/// Invariants: `left <= right`, and `best` (when set) always holds a candidate
/// that met the success policy.
#[derive(Debug)]
pub struct SearchState {
    phase: SearchPhase,
    left: f64,
    right: f64,
    best: Option<Evaluation>,
    last: Option<Evaluation>,
    iterations: usize,
    records: Vec<CandidateRecord>,
    cache: HashMap<u64, CachedResult>,
}

impl SearchState {
    pub fn new(left: f64, right: f64) -> Self {
        Self {
            phase: SearchPhase::Init,
            left: left.min(right),
            right: right.max(left),
            best: None,
            last: None,
            iterations: 0,
            records: Vec::new(),
            cache: HashMap::new(),
        }
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn left(&self) -> f64 {
        self.left
    }

    pub fn right(&self) -> f64 {
        self.right
    }

    /// Number of perturbed candidates actually sent to the classifier.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn best(&self) -> Option<&Evaluation> {
        self.best.as_ref()
    }

    pub fn best_epsilon(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.epsilon)
    }

    pub fn last(&self) -> Option<&Evaluation> {
        self.last.as_ref()
    }

    pub fn records(&self) -> &[CandidateRecord] {
        &self.records
    }

    pub(crate) fn advance(&mut self, next: SearchPhase) -> Result<SearchPhase, SearchError> {
        if !self.phase.can_transition_to(next) {
            return Err(SearchError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.phase;
        self.phase = next;
        Ok(previous)
    }

    /// Raise the lower bound after a failed candidate.
    pub(crate) fn raise_left(&mut self, epsilon: f64) {
        self.left = epsilon.clamp(self.left, self.right);
    }

    /// Lower the upper bound after a successful candidate.
    pub(crate) fn lower_right(&mut self, epsilon: f64) {
        self.right = epsilon.clamp(self.left, self.right);
    }

    /// Result already known for this exact epsilon, rebuilt around `image`.
    pub(crate) fn cached(&self, epsilon: f64, image: ImageTensor) -> Option<Evaluation> {
        self.cache.get(&epsilon.to_bits()).map(|hit| Evaluation {
            epsilon,
            image,
            classification: hit.classification.clone(),
            error: hit.error.clone(),
            succeeded: hit.succeeded,
        })
    }

    pub(crate) fn is_cached(&self, epsilon: f64) -> bool {
        self.cache.contains_key(&epsilon.to_bits())
    }

    /// Record a fresh classifier answer (or failure) for a candidate.
    ///
    /// An answered candidate inside `[left, right]` narrows the window: a
    /// success lowers `right`, anything else raises `left`. Failed
    /// classifications and out-of-window candidates leave it alone.
    pub(crate) fn record(&mut self, phase: SearchPhase, evaluation: &Evaluation) {
        self.iterations += 1;
        let epsilon = evaluation.epsilon;
        if evaluation.classification.is_some() && (self.left..=self.right).contains(&epsilon) {
            if evaluation.succeeded {
                self.lower_right(epsilon);
            } else {
                self.raise_left(epsilon);
            }
        }
        self.records.push(CandidateRecord {
            epsilon: evaluation.epsilon,
            phase,
            classification: evaluation.classification.clone(),
            error: evaluation.error.clone(),
            succeeded: evaluation.succeeded,
        });
        self.cache.insert(
            evaluation.epsilon.to_bits(),
            CachedResult {
                classification: evaluation.classification.clone(),
                error: evaluation.error.clone(),
                succeeded: evaluation.succeeded,
            },
        );
        self.observe(evaluation);
    }

    /// Track `evaluation` as the latest candidate and, if it is a smaller
    /// success, as the best one.
    pub(crate) fn observe(&mut self, evaluation: &Evaluation) {
        if evaluation.succeeded {
            let smaller = self
                .best
                .as_ref()
                .map_or(true, |best| evaluation.epsilon < best.epsilon);
            if smaller {
                self.best = Some(evaluation.clone());
            }
        }
        self.last = Some(evaluation.clone());
    }

    pub(crate) fn take_records(&mut self) -> Vec<CandidateRecord> {
        std::mem::take(&mut self.records)
    }

    pub(crate) fn take_best(&mut self) -> Option<Evaluation> {
        self.best.take()
    }

    pub(crate) fn take_last(&mut self) -> Option<Evaluation> {
        self.last.take()
    }
}
