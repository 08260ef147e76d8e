//! Epsilon search controller.
//!
//! Drives one search from the baseline classification to a terminal verdict:
//!
//! 1. classify the unperturbed image (fatal on failure),
//! 2. probe `epsilon_max`, falling back to one forced large epsilon,
//! 3. coarse scan up to the first reliable flip (the anchor),
//! 4. fine scan `[anchor - coarse_step, anchor]`,
//! 5. optionally probe `best - precision` once,
//! 6. assemble the outcome.
//!
//! Candidates whose classification fails are recorded and skipped.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use es_oracle::Classifier;
use es_types::{
    Classification, DirectionTensor, ImageTensor, ScanStrategy, SearchConfig, SearchError,
    SearchId, SearchOutcome, SearchPhase, TensorError, Verdict,
};
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::{SearchBudget, StopReason};
use crate::events::{EventSink, SearchEvent};
use crate::grid::{fine_window, linear_grid, LinearGrid};
use crate::state::{Evaluation, SearchState};

/// Baseline confidence below which the attack is flagged as unreliable.
const LOW_BASELINE_CONFIDENCE: f64 = 0.01;

/// Why a phase stopped early.
pub(crate) enum Halt {
    Interrupted(StopReason),
    Failed(SearchError),
}

impl From<SearchError> for Halt {
    fn from(err: SearchError) -> Self {
        Halt::Failed(err)
    }
}

impl From<StopReason> for Halt {
    fn from(reason: StopReason) -> Self {
        Halt::Interrupted(reason)
    }
}

pub(crate) type Flow<T> = Result<T, Halt>;

/// Terminal verdict plus the candidate attached to the outcome.
pub(crate) type Conclusion = (Verdict, Option<Evaluation>);

/// Per-invocation context. Never shared between searches.
pub(crate) struct Run<'a> {
    pub(crate) id: SearchId,
    pub(crate) image: &'a ImageTensor,
    pub(crate) direction: &'a DirectionTensor,
    pub(crate) original: Classification,
    pub(crate) state: SearchState,
    pub(crate) warnings: Vec<String>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) clock: Instant,
}

/// Minimal-epsilon search along a fixed FGSM direction.
///
/// Holds only read-only collaborators; each call to [`EpsilonSearch::search`]
/// builds its own [`SearchState`], so one controller can serve many searches.
pub struct EpsilonSearch<C> {
    classifier: C,
    config: SearchConfig,
    budget: SearchBudget,
    events: EventSink,
}

impl<C: Classifier> EpsilonSearch<C> {
    /// Create a controller. Fails if `config` does not validate.
    pub fn new(classifier: C, config: SearchConfig) -> Result<Self, SearchError> {
        config.validate()?;
        Ok(Self {
            classifier,
            config,
            budget: SearchBudget::default(),
            events: EventSink::default(),
        })
    }

    pub fn with_budget(mut self, budget: SearchBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Stream [`SearchEvent`]s to `tx` while searching.
    pub fn with_events(mut self, tx: Sender<SearchEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn budget(&self) -> &SearchBudget {
        &self.budget
    }

    /// Run a full search, classifying the unperturbed image first.
    pub fn search(
        &self,
        image: &ImageTensor,
        direction: &DirectionTensor,
    ) -> Result<SearchOutcome, SearchError> {
        check_shapes(image, direction)?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut state = self.fresh_state();
        self.step(id, &mut state, SearchPhase::OriginalEval)?;

        let original = self
            .classifier
            .classify(image)
            .and_then(|c| c.validate().map(|_| c))
            .map_err(|e| SearchError::BaselineClassification {
                message: e.to_string(),
            })?;

        self.drive(Run {
            id,
            image,
            direction,
            original,
            state,
            warnings: Vec::new(),
            started_at,
            clock,
        })
    }

    /// Run a search with a baseline the caller already obtained, e.g. while
    /// building the gradient target. The classifier is not asked again.
    pub fn search_from_baseline(
        &self,
        image: &ImageTensor,
        direction: &DirectionTensor,
        original: Classification,
    ) -> Result<SearchOutcome, SearchError> {
        check_shapes(image, direction)?;
        original
            .validate()
            .map_err(|e| SearchError::BaselineClassification {
                message: e.to_string(),
            })?;

        let id = Uuid::new_v4();
        let mut state = self.fresh_state();
        self.step(id, &mut state, SearchPhase::OriginalEval)?;

        self.drive(Run {
            id,
            image,
            direction,
            original,
            state,
            warnings: Vec::new(),
            started_at: Utc::now(),
            clock: Instant::now(),
        })
    }

    fn fresh_state(&self) -> SearchState {
        SearchState::new(self.config.bounds.epsilon_min, self.config.bounds.epsilon_max)
    }

    fn drive(&self, mut run: Run<'_>) -> Result<SearchOutcome, SearchError> {
        info!(
            search_id = %run.id,
            "Original prediction: {}",
            run.original
        );
        if run.original.confidence < LOW_BASELINE_CONFIDENCE {
            let message = format!(
                "original image has very low confidence ({:.2}%), attack may be unreliable",
                run.original.confidence * 100.0
            );
            warn!(search_id = %run.id, "{message}");
            run.warnings.push(message);
        }

        match self.explore(&mut run) {
            Ok((verdict, attached)) => Ok(self.finish(run, verdict, attached)),
            Err(Halt::Interrupted(reason)) => {
                warn!(search_id = %run.id, %reason, "Search interrupted");
                run.warnings.push(reason.to_string());
                self.transition(&mut run, SearchPhase::Interrupted)?;
                let attached = run.state.take_best().or_else(|| run.state.take_last());
                Ok(self.finish(run, Verdict::Interrupted, attached))
            }
            Err(Halt::Failed(err)) => Err(err),
        }
    }

    fn explore(&self, run: &mut Run<'_>) -> Flow<Conclusion> {
        let bounds = self.config.bounds;

        self.transition(run, SearchPhase::FeasibilityProbe)?;
        let probe = self.evaluate(run, bounds.epsilon_max)?;

        if bounds.is_degenerate() {
            let terminal = if probe.succeeded {
                (SearchPhase::Success, Verdict::Success)
            } else {
                (SearchPhase::Infeasible, Verdict::Infeasible)
            };
            self.transition(run, terminal.0)?;
            return Ok((terminal.1, Some(probe)));
        }

        // An unanswered epsilon_max says nothing about feasibility. Scan
        // anyway; it cannot anchor the fine scan.
        let probe = if probe.classification.is_none() {
            let message = format!(
                "classification failed at epsilon_max {}, continuing with the scan",
                bounds.epsilon_max
            );
            warn!(search_id = %run.id, "{message}");
            run.warnings.push(message);
            None
        } else if !probe.succeeded {
            warn!(
                search_id = %run.id,
                epsilon_max = bounds.epsilon_max,
                "Maximum epsilon does not produce a reliable attack"
            );
            return self.forced_fallback(run, probe);
        } else {
            Some(probe)
        };

        match self.config.strategy {
            ScanStrategy::CoarseToFine => self.coarse_to_fine(run, probe),
            ScanStrategy::Bisection {
                precision,
                max_iterations,
            } => self.bisect(run, probe, precision, max_iterations),
        }
    }

    fn forced_fallback(&self, run: &mut Run<'_>, probe: Evaluation) -> Flow<Conclusion> {
        let Some(forced_epsilon) = self.config.forced_fallback_epsilon else {
            self.transition(run, SearchPhase::Infeasible)?;
            return Ok((Verdict::Infeasible, Some(probe)));
        };

        self.transition(run, SearchPhase::ForcedFallback)?;
        info!(search_id = %run.id, epsilon = forced_epsilon, "Trying forced fallback epsilon");
        let forced = self.evaluate(run, forced_epsilon)?;

        if forced.succeeded {
            let message = format!(
                "only the forced fallback epsilon {forced_epsilon} flipped the label"
            );
            warn!(search_id = %run.id, "{message}");
            run.warnings.push(message);
            self.transition(run, SearchPhase::Success)?;
            return Ok((Verdict::ForcedSuccess, Some(forced)));
        }

        self.transition(run, SearchPhase::Infeasible)?;
        Ok((
            Verdict::Infeasible,
            Some(Evaluation::closer_to_success(probe, forced, &run.original)),
        ))
    }

    /// `at_max` is the successful `epsilon_max` evaluation, or `None` when the
    /// classifier failed on it.
    fn coarse_to_fine(&self, run: &mut Run<'_>, at_max: Option<Evaluation>) -> Flow<Conclusion> {
        let bounds = self.config.bounds;
        let steps = self.config.steps;

        self.transition(run, SearchPhase::CoarseScan)?;
        let coarse = linear_grid(bounds.epsilon_min, bounds.epsilon_max, steps.coarse);

        let (anchor, window_start) = match self.coarse_scan(run, coarse)? {
            Some((anchor, previous)) => (anchor, previous.unwrap_or(anchor)),
            None if self.config.anchor_on_probe && at_max.is_some() => {
                info!(
                    search_id = %run.id,
                    "Coarse scan stepped over the crossing, anchoring on the epsilon_max probe"
                );
                let start = (bounds.epsilon_max - steps.coarse).max(bounds.epsilon_min);
                (bounds.epsilon_max, start)
            }
            None => {
                let message = if at_max.is_some() {
                    "coarse scan found no reliable flip although epsilon_max succeeded"
                } else {
                    "coarse scan found no reliable flip"
                };
                warn!(search_id = %run.id, "{message}");
                run.warnings.push(message.to_string());
                self.transition(run, SearchPhase::Infeasible)?;
                let attached = at_max.or_else(|| run.state.take_last());
                return Ok((Verdict::Infeasible, attached));
            }
        };
        info!(search_id = %run.id, anchor, "Coarse anchor found");

        self.transition(run, SearchPhase::FineScan)?;
        for epsilon in fine_window(window_start, anchor, steps.fine) {
            if self.evaluate(run, epsilon)?.succeeded {
                break;
            }
        }

        self.tighten(run, self.config.tighten_precision)?;
        self.conclude_success(run)
    }

    /// First coarse candidate that met the success policy, with the candidate
    /// scanned just before it. Pulls `coarse_batch` candidates at a time.
    fn coarse_scan(
        &self,
        run: &mut Run<'_>,
        mut candidates: LinearGrid,
    ) -> Flow<Option<(f64, Option<f64>)>> {
        let batch = self.config.coarse_batch.max(1);
        let mut chunk = Vec::with_capacity(batch);
        let mut previous = None;

        loop {
            chunk.clear();
            chunk.extend(candidates.by_ref().take(batch));
            if chunk.is_empty() {
                return Ok(None);
            }

            let evaluations = self.evaluate_chunk(run, &chunk)?;
            if let Some(position) = evaluations.iter().position(|e| e.succeeded) {
                let before = match position {
                    0 => previous,
                    p => Some(evaluations[p - 1].epsilon),
                };
                return Ok(Some((evaluations[position].epsilon, before)));
            }
            if evaluations.len() < chunk.len() {
                return Err(StopReason::EvaluationLimit.into());
            }
            previous = chunk.last().copied();
        }
    }

    /// Probe `best - precision` once and keep it if it still succeeds.
    pub(crate) fn tighten(&self, run: &mut Run<'_>, precision: Option<f64>) -> Flow<()> {
        let (Some(precision), Some(best)) = (precision, run.state.best_epsilon()) else {
            return Ok(());
        };
        let candidate = (best - precision).max(self.config.bounds.epsilon_min);
        if candidate >= best {
            return Ok(());
        }

        self.transition(run, SearchPhase::Tighten)?;
        if self.evaluate(run, candidate)?.succeeded {
            info!(search_id = %run.id, epsilon = candidate, "Found an even smaller working epsilon");
        }
        Ok(())
    }

    pub(crate) fn conclude_success(&self, run: &mut Run<'_>) -> Flow<Conclusion> {
        self.transition(run, SearchPhase::Success)?;
        Ok((Verdict::Success, run.state.take_best()))
    }

    pub(crate) fn transition(&self, run: &mut Run<'_>, next: SearchPhase) -> Result<(), SearchError> {
        self.step(run.id, &mut run.state, next)
    }

    fn step(&self, id: SearchId, state: &mut SearchState, next: SearchPhase) -> Result<(), SearchError> {
        let from = state.advance(next)?;
        debug!(search_id = %id, %from, to = %next, "Search phase change");
        self.events.emit(SearchEvent::PhaseChanged {
            search_id: id,
            from,
            to: next,
        });
        Ok(())
    }

    /// Evaluate one candidate, reusing a result already known for `epsilon`.
    pub(crate) fn evaluate(&self, run: &mut Run<'_>, epsilon: f64) -> Flow<Evaluation> {
        if let Some(hit) = self.cached(run, epsilon)? {
            return Ok(hit);
        }

        self.budget.allowance(run.clock, run.state.iterations())?;
        let evaluation = self.classify_candidate(run.image, run.direction, &run.original, epsilon);
        self.absorb(run, &evaluation);
        Ok(evaluation)
    }

    /// Evaluate a batch of coarse candidates, concurrently when it has more
    /// than one fresh candidate. Results come back in epsilon order; the batch
    /// is cut short when the evaluation budget runs out.
    fn evaluate_chunk(&self, run: &mut Run<'_>, chunk: &[f64]) -> Flow<Vec<Evaluation>> {
        if chunk.len() == 1 {
            return Ok(vec![self.evaluate(run, chunk[0])?]);
        }

        let fresh = chunk.iter().filter(|eps| !run.state.is_cached(**eps)).count();
        let allowance = if fresh > 0 {
            self.budget.allowance(run.clock, run.state.iterations())?
        } else {
            usize::MAX
        };

        let mut admitted: Vec<(f64, bool)> = Vec::with_capacity(chunk.len());
        let mut taken = 0;
        for &epsilon in chunk {
            let cached = run.state.is_cached(epsilon);
            if !cached {
                if taken == allowance {
                    break;
                }
                taken += 1;
            }
            admitted.push((epsilon, cached));
        }

        let (image, direction, original) = (run.image, run.direction, &run.original);
        let fresh_results: Vec<Option<Evaluation>> = admitted
            .par_iter()
            .map(|&(epsilon, cached)| {
                (!cached).then(|| self.classify_candidate(image, direction, original, epsilon))
            })
            .collect();

        let mut evaluations = Vec::with_capacity(admitted.len());
        for ((epsilon, _), result) in admitted.into_iter().zip(fresh_results) {
            let evaluation = match result {
                Some(evaluation) => {
                    self.absorb(run, &evaluation);
                    evaluation
                }
                None => match self.cached(run, epsilon)? {
                    Some(hit) => hit,
                    None => continue,
                },
            };
            evaluations.push(evaluation);
        }
        Ok(evaluations)
    }

    fn cached(&self, run: &mut Run<'_>, epsilon: f64) -> Result<Option<Evaluation>, SearchError> {
        if !run.state.is_cached(epsilon) {
            return Ok(None);
        }
        let image = run
            .image
            .perturb(run.direction, epsilon, self.config.policy.clip)?;
        let hit = run.state.cached(epsilon, image);
        if let Some(evaluation) = &hit {
            run.state.observe(evaluation);
        }
        Ok(hit)
    }

    /// Clamp, classify and judge one candidate. Never fails: oracle errors
    /// become an unsuccessful evaluation carrying the error message.
    fn classify_candidate(
        &self,
        image: &ImageTensor,
        direction: &DirectionTensor,
        original: &Classification,
        epsilon: f64,
    ) -> Evaluation {
        let failed = |image: ImageTensor, message: String| Evaluation {
            epsilon,
            image,
            classification: None,
            error: Some(SearchError::CandidateEvaluation { epsilon, message }.to_string()),
            succeeded: false,
        };

        let perturbed = match image.perturb(direction, epsilon, self.config.policy.clip) {
            Ok(perturbed) => perturbed,
            Err(e) => return failed(image.clone(), e.to_string()),
        };

        match self
            .classifier
            .classify(&perturbed)
            .and_then(|c| c.validate().map(|_| c))
        {
            Ok(classification) => {
                let succeeded = self.config.policy.accepts(original, &classification);
                Evaluation {
                    epsilon,
                    image: perturbed,
                    classification: Some(classification),
                    error: None,
                    succeeded,
                }
            }
            Err(e) => failed(perturbed, e.to_string()),
        }
    }

    fn absorb(&self, run: &mut Run<'_>, evaluation: &Evaluation) {
        let phase = run.state.phase();
        run.state.record(phase, evaluation);

        match (&evaluation.classification, &evaluation.error) {
            (Some(c), _) => {
                debug!(
                    search_id = %run.id,
                    %phase,
                    epsilon = evaluation.epsilon,
                    succeeded = evaluation.succeeded,
                    "Trying epsilon {:.6} -> {}",
                    evaluation.epsilon,
                    c
                );
                self.events.emit(SearchEvent::CandidateEvaluated {
                    search_id: run.id,
                    phase,
                    epsilon: evaluation.epsilon,
                    label: c.label.clone(),
                    confidence: c.confidence,
                    succeeded: evaluation.succeeded,
                });
            }
            (None, error) => {
                let error = error.clone().unwrap_or_default();
                warn!(
                    search_id = %run.id,
                    %phase,
                    epsilon = evaluation.epsilon,
                    "Skipping candidate: {error}"
                );
                self.events.emit(SearchEvent::CandidateFailed {
                    search_id: run.id,
                    phase,
                    epsilon: evaluation.epsilon,
                    error,
                });
            }
        }
    }

    fn finish(&self, mut run: Run<'_>, verdict: Verdict, attached: Option<Evaluation>) -> SearchOutcome {
        let success =
            verdict != Verdict::Infeasible && attached.as_ref().map_or(false, |e| e.succeeded);

        let (epsilon_used, adversarial, adversarial_image) = match attached {
            Some(evaluation) => (
                evaluation.epsilon,
                evaluation.classification,
                evaluation.image,
            ),
            None => (0.0, None, run.image.clone()),
        };

        match (success, &adversarial) {
            (true, Some(adv)) => info!(
                search_id = %run.id,
                ?verdict,
                "Attack successful! Minimum epsilon ~ {:.6}, adversarial class: {}",
                epsilon_used,
                adv
            ),
            _ => info!(
                search_id = %run.id,
                ?verdict,
                epsilon_used,
                "Attack did not find a reliable adversarial example"
            ),
        }
        self.events.emit(SearchEvent::Finished {
            search_id: run.id,
            verdict,
            epsilon_used,
        });

        SearchOutcome {
            id: run.id,
            verdict,
            success,
            epsilon_used,
            original: run.original,
            adversarial,
            original_image: run.image.clone(),
            direction: run.direction.clone(),
            adversarial_image,
            iterations: run.state.iterations(),
            evaluations: run.state.take_records(),
            warnings: run.warnings,
            started_at: run.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn check_shapes(image: &ImageTensor, direction: &DirectionTensor) -> Result<(), SearchError> {
    if image.shape() != direction.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: image.shape().to_vec(),
            actual: direction.shape().to_vec(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CancelToken;
    use crossbeam_channel::unbounded;
    use es_oracle::{FlipRule, ScriptedOracle, ScriptedOracleConfig};
    use es_types::ClipRange;

    const ORIGINAL_LABEL: &str = "n02510455";

    fn image() -> ImageTensor {
        ImageTensor::filled(4, 4, 3, 0.0)
    }

    fn direction() -> DirectionTensor {
        DirectionTensor::uniform(4, 4, 3, 1.0).unwrap()
    }

    fn oracle(config: ScriptedOracleConfig) -> ScriptedOracle {
        ScriptedOracle::new(config, image())
    }

    fn flips_at(epsilon: f64) -> ScriptedOracle {
        oracle(ScriptedOracleConfig::default().with_rule(FlipRule::AtLeast { epsilon }))
    }

    fn scenario_config() -> SearchConfig {
        SearchConfig::default()
            .with_bounds(0.001, 0.1)
            .with_steps(0.01, 0.001)
    }

    fn run(oracle: &ScriptedOracle, config: SearchConfig) -> SearchOutcome {
        EpsilonSearch::new(oracle, config)
            .unwrap()
            .search(&image(), &direction())
            .unwrap()
    }

    /// Re-check a reported epsilon directly against the oracle.
    fn succeeds_at(oracle: &ScriptedOracle, config: &SearchConfig, epsilon: f64) -> bool {
        let adv = image()
            .perturb(&direction(), epsilon, config.policy.clip)
            .unwrap();
        let c = oracle.classify(&adv).unwrap();
        c.label != ORIGINAL_LABEL && c.confidence >= config.policy.min_confidence
    }

    #[test]
    fn scenario_a_unit_coarse_step() {
        let oracle = flips_at(0.037);
        let config = SearchConfig::default()
            .with_bounds(0.001, 0.1)
            .with_steps(0.001, 0.0001);
        let outcome = run(&oracle, config);

        assert_eq!(outcome.verdict, Verdict::Success);
        assert!(outcome.success);
        assert!((outcome.epsilon_used - 0.037).abs() <= 0.0001 + 1e-9);
        assert_eq!(outcome.adversarial.as_ref().unwrap().label, "n02509815");
        assert_eq!(outcome.original.label, ORIGINAL_LABEL);
    }

    #[test]
    fn scenario_a_coarse_then_fine() {
        let oracle = flips_at(0.037);
        let config = scenario_config();
        let outcome = run(&oracle, config.clone());

        assert_eq!(outcome.verdict, Verdict::Success);
        assert!((outcome.epsilon_used - 0.037).abs() <= config.steps.fine + 1e-9);
        // The fine scan never revisits the coarse anchor or the probe.
        assert_eq!(outcome.iterations, oracle.classify_calls() - 1);
        assert_eq!(outcome.evaluations.len(), outcome.iterations);
    }

    #[test]
    fn success_is_minimal_within_fine_resolution() {
        let config = scenario_config();
        for threshold in [0.005, 0.0123, 0.05, 0.0999] {
            let oracle = flips_at(threshold);
            let outcome = run(&oracle, config.clone());

            assert_eq!(outcome.verdict, Verdict::Success, "threshold {threshold}");
            assert!(config.bounds.contains(outcome.epsilon_used));
            assert!(succeeds_at(&oracle, &config, outcome.epsilon_used));

            let below = outcome.epsilon_used - config.steps.fine;
            if below >= config.bounds.epsilon_min {
                assert!(
                    !succeeds_at(&oracle, &config, below),
                    "threshold {threshold}: {below} also succeeds"
                );
            }
        }
    }

    #[test]
    fn scenario_b_never_flips() {
        let oracle = oracle(ScriptedOracleConfig::default());
        let outcome = run(&oracle, scenario_config());

        assert_eq!(outcome.verdict, Verdict::Infeasible);
        assert!(!outcome.success);
        assert_eq!(outcome.epsilon_used, 0.1);
        assert_eq!(outcome.adversarial.as_ref().unwrap().label, ORIGINAL_LABEL);
        // baseline, probe, forced fallback: no scan runs
        assert_eq!(oracle.classify_calls(), 3);
    }

    #[test]
    fn scenario_c_only_forced_fallback_flips() {
        let oracle = oracle(
            ScriptedOracleConfig::default().with_rule(FlipRule::Exactly { epsilon: 0.5 }),
        );
        let outcome = run(&oracle, scenario_config());

        assert_eq!(outcome.verdict, Verdict::ForcedSuccess);
        assert!(outcome.success);
        assert_eq!(outcome.epsilon_used, 0.5);
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn scenario_d_degenerate_range_evaluates_once() {
        let config = SearchConfig::default().with_bounds(0.05, 0.05);

        let hit = flips_at(0.03);
        let outcome = run(&hit, config.clone());
        assert_eq!(outcome.verdict, Verdict::Success);
        assert_eq!(outcome.epsilon_used, 0.05);
        assert_eq!(hit.classify_calls(), 2);

        let miss = oracle(ScriptedOracleConfig::default());
        let outcome = run(&miss, config);
        assert_eq!(outcome.verdict, Verdict::Infeasible);
        assert_eq!(miss.classify_calls(), 2);
    }

    #[test]
    fn infeasible_without_forced_fallback() {
        let oracle = oracle(ScriptedOracleConfig::default());
        let outcome = run(&oracle, scenario_config().with_forced_fallback(None));
        assert_eq!(outcome.verdict, Verdict::Infeasible);
        assert_eq!(oracle.classify_calls(), 2);
    }

    #[test]
    fn infeasible_attaches_candidate_closer_to_success() {
        // Forced fallback flips the label, but not confidently enough.
        let oracle = oracle(
            ScriptedOracleConfig::default()
                .with_rule(FlipRule::Exactly { epsilon: 0.5 })
                .with_adversarial_confidence(0.0001),
        );
        let outcome = run(&oracle, scenario_config().with_min_confidence(0.01));

        assert_eq!(outcome.verdict, Verdict::Infeasible);
        assert!(!outcome.success);
        assert_eq!(outcome.epsilon_used, 0.5);
    }

    #[test]
    fn low_confidence_flips_are_not_successes() {
        let oracle = oracle(
            ScriptedOracleConfig::default()
                .with_rule(FlipRule::AtLeast { epsilon: 0.02 })
                .with_unreliable_below(0.06, 0.0001),
        );
        let config = scenario_config().with_min_confidence(0.01);
        let outcome = run(&oracle, config.clone());

        assert_eq!(outcome.verdict, Verdict::Success);
        assert!((outcome.epsilon_used - 0.06).abs() <= config.steps.fine + 1e-9);
        assert!(outcome.adversarial.as_ref().unwrap().confidence >= 0.01);
        assert!(outcome.evaluations.iter().any(|r| {
            !r.succeeded
                && r.classification
                    .as_ref()
                    .map_or(false, |c| c.label != ORIGINAL_LABEL)
        }));
    }

    #[test]
    fn candidate_errors_are_skipped() {
        let oracle = oracle(
            ScriptedOracleConfig::default()
                .with_rule(FlipRule::AtLeast { epsilon: 0.037 })
                .with_failure_at(0.021),
        );
        let outcome = run(&oracle, scenario_config());

        assert_eq!(outcome.verdict, Verdict::Success);
        assert!((outcome.epsilon_used - 0.037).abs() <= 0.001 + 1e-9);
        let failed: Vec<_> = outcome.evaluations.iter().filter(|r| r.error.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert!(!failed[0].succeeded);
        assert_eq!(failed[0].phase, SearchPhase::CoarseScan);
    }

    #[test]
    fn baseline_failure_is_fatal() {
        let oracle = oracle(ScriptedOracleConfig {
            fail_classifier: true,
            ..ScriptedOracleConfig::default()
        });
        let err = EpsilonSearch::new(&oracle, scenario_config())
            .unwrap()
            .search(&image(), &direction())
            .unwrap_err();
        assert!(matches!(err, SearchError::BaselineClassification { .. }));
        assert_eq!(oracle.classify_calls(), 1);
    }

    #[test]
    fn mismatched_direction_is_rejected_before_any_call() {
        let oracle = flips_at(0.037);
        let wrong = DirectionTensor::uniform(2, 2, 3, 1.0).unwrap();
        let err = EpsilonSearch::new(&oracle, scenario_config())
            .unwrap()
            .search(&image(), &wrong)
            .unwrap_err();
        assert!(matches!(err, SearchError::Tensor(TensorError::ShapeMismatch { .. })));
        assert_eq!(oracle.classify_calls(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let oracle = flips_at(0.037);
        let config = scenario_config().with_steps(0.0, 0.001);
        assert!(EpsilonSearch::new(&oracle, config).is_err());
    }

    #[test]
    fn max_epsilon_anchors_fine_scan_when_coarse_scan_misses() {
        // Flips only in a band the coarse grid (0.001, 0.011, ... 0.091) never lands in.
        let rule = FlipRule::Within {
            low: 0.095,
            high: 0.1,
        };
        let oracle_on = oracle(ScriptedOracleConfig::default().with_rule(rule.clone()));
        let outcome = run(&oracle_on, scenario_config());
        assert_eq!(outcome.verdict, Verdict::Success);
        assert!((outcome.epsilon_used - 0.095).abs() <= 0.001 + 1e-9);

        let oracle_off = oracle(ScriptedOracleConfig::default().with_rule(rule));
        let outcome = run(&oracle_off, scenario_config().with_anchor_on_probe(false));
        assert_eq!(outcome.verdict, Verdict::Infeasible);
        assert!(!outcome.success);
        assert_eq!(outcome.epsilon_used, 0.1);
    }

    #[test]
    fn unanswered_max_epsilon_falls_through_to_scan() {
        let oracle = oracle(
            ScriptedOracleConfig::default()
                .with_rule(FlipRule::AtLeast { epsilon: 0.037 })
                .with_failure_at(0.1),
        );
        let outcome = run(&oracle, scenario_config());

        assert_eq!(outcome.verdict, Verdict::Success);
        assert!((outcome.epsilon_used - 0.037).abs() <= 0.001 + 1e-9);
        assert!(!outcome.warnings.is_empty());
        assert_eq!(outcome.evaluations[0].phase, SearchPhase::FeasibilityProbe);
        assert!(outcome.evaluations[0].error.is_some());
        assert!(outcome
            .evaluations
            .iter()
            .all(|r| r.phase != SearchPhase::ForcedFallback));
    }

    #[test]
    fn unanswered_max_epsilon_without_flip_is_infeasible() {
        let oracle = oracle(ScriptedOracleConfig::default().with_failure_at(0.1));
        let outcome = run(&oracle, scenario_config());

        assert_eq!(outcome.verdict, Verdict::Infeasible);
        assert!(!outcome.success);
        assert!(outcome
            .evaluations
            .iter()
            .all(|r| r.phase != SearchPhase::ForcedFallback));
        // Attached candidate is the last one scanned, not the failed epsilon_max.
        assert!(outcome.epsilon_used < 0.1);
    }

    #[test]
    fn tiny_coarse_step_stops_at_evaluation_limit() {
        for batch in [1, 4] {
            let oracle = flips_at(0.037);
            let config = SearchConfig::default()
                .with_bounds(0.0, 1.0)
                .with_steps(1e-12, 1e-12)
                .with_coarse_batch(batch);
            let outcome = EpsilonSearch::new(&oracle, config)
                .unwrap()
                .with_budget(SearchBudget::unlimited().with_max_evaluations(5))
                .search(&image(), &direction())
                .unwrap();

            assert_eq!(outcome.verdict, Verdict::Interrupted);
            assert_eq!(outcome.iterations, 5);
            // baseline plus five candidates
            assert_eq!(oracle.classify_calls(), 6);
        }
    }

    #[test]
    fn tighten_adopts_smaller_success() {
        let oracle = flips_at(0.0372);
        let config = scenario_config().with_tighten_precision(Some(0.0005));
        let outcome = run(&oracle, config);

        assert_eq!(outcome.verdict, Verdict::Success);
        assert!((outcome.epsilon_used - 0.0375).abs() < 1e-9);
        assert_eq!(outcome.evaluations.last().unwrap().phase, SearchPhase::Tighten);
    }

    #[test]
    fn searches_are_idempotent() {
        let oracle = flips_at(0.0421);
        let a = run(&oracle, scenario_config());
        let b = run(&oracle, scenario_config());
        assert_eq!(a.epsilon_used, b.epsilon_used);
        assert_eq!(a.success, b.success);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn parallel_coarse_batches_match_sequential_scan() {
        let config = SearchConfig::default()
            .with_bounds(0.001, 0.1)
            .with_steps(0.001, 0.0001);

        let sequential = run(&flips_at(0.037), config.clone());
        let parallel_oracle = flips_at(0.037);
        let parallel = run(&parallel_oracle, config.with_coarse_batch(8));

        assert_eq!(parallel.verdict, Verdict::Success);
        assert_eq!(parallel.epsilon_used, sequential.epsilon_used);
        // Batches past the first success are never evaluated.
        assert!(parallel_oracle.classify_calls() <= sequential.iterations + 1 + 8);
    }

    #[test]
    fn cancelled_search_is_interrupted_before_probe() {
        let oracle = flips_at(0.037);
        let token = CancelToken::new();
        token.cancel();
        let outcome = EpsilonSearch::new(&oracle, scenario_config())
            .unwrap()
            .with_budget(SearchBudget::unlimited().with_cancel(token))
            .search(&image(), &direction())
            .unwrap();

        assert_eq!(outcome.verdict, Verdict::Interrupted);
        assert!(!outcome.success);
        assert!(outcome.adversarial.is_none());
        assert_eq!(outcome.epsilon_used, 0.0);
        assert_eq!(oracle.classify_calls(), 1);
    }

    #[test]
    fn evaluation_limit_keeps_best_so_far() {
        let oracle = flips_at(0.037);
        let outcome = EpsilonSearch::new(&oracle, scenario_config())
            .unwrap()
            .with_budget(SearchBudget::unlimited().with_max_evaluations(3))
            .search(&image(), &direction())
            .unwrap();

        assert_eq!(outcome.verdict, Verdict::Interrupted);
        assert!(outcome.success);
        assert_eq!(outcome.epsilon_used, 0.1);
        assert_eq!(outcome.iterations, 3);
    }

    #[test]
    fn low_baseline_confidence_is_flagged() {
        let oracle = oracle(ScriptedOracleConfig {
            rule: FlipRule::AtLeast { epsilon: 0.037 },
            original_confidence: 0.005,
            ..ScriptedOracleConfig::default()
        });
        let outcome = run(&oracle, scenario_config());
        assert!(outcome.warnings.iter().any(|w| w.contains("low confidence")));
    }

    #[test]
    fn events_trace_the_state_machine() {
        let oracle = flips_at(0.037);
        let (tx, rx) = unbounded();
        let outcome = EpsilonSearch::new(&oracle, scenario_config())
            .unwrap()
            .with_events(tx)
            .search(&image(), &direction())
            .unwrap();

        let events: Vec<SearchEvent> = rx.try_iter().collect();
        assert!(matches!(
            events.first(),
            Some(SearchEvent::PhaseChanged {
                from: SearchPhase::Init,
                to: SearchPhase::OriginalEval,
                ..
            })
        ));
        let phases: Vec<SearchPhase> = events
            .iter()
            .filter_map(|e| match e {
                SearchEvent::PhaseChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                SearchPhase::OriginalEval,
                SearchPhase::FeasibilityProbe,
                SearchPhase::CoarseScan,
                SearchPhase::FineScan,
                SearchPhase::Success,
            ]
        );
        match events.last() {
            Some(SearchEvent::Finished {
                verdict,
                epsilon_used,
                search_id,
            }) => {
                assert_eq!(*verdict, Verdict::Success);
                assert_eq!(*epsilon_used, outcome.epsilon_used);
                assert_eq!(*search_id, outcome.id);
            }
            other => panic!("expected Finished event, got {other:?}"),
        }
    }

    #[test]
    fn outcome_carries_all_three_tensors() {
        let oracle = flips_at(0.037);
        let outcome = run(&oracle, scenario_config());
        assert_eq!(outcome.original_image, image());
        assert_eq!(outcome.direction, direction());
        let expected = image()
            .perturb(&direction(), outcome.epsilon_used, ClipRange::symmetric_unit())
            .unwrap();
        assert_eq!(outcome.adversarial_image, expected);

        let summary = outcome.summary();
        assert_eq!(summary.epsilon_used, outcome.epsilon_used);
        assert!(serde_json::to_string(&summary).is_ok());
    }
}
