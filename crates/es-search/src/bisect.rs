//! Bisection over `[epsilon_min, epsilon_max]`, an alternative to the
//! coarse-to-fine scan. Assumes the flip is monotone in epsilon.

use es_oracle::Classifier;
use es_types::{SearchPhase, Verdict};
use tracing::{debug, info, warn};

use crate::controller::{Conclusion, EpsilonSearch, Flow, Run};
use crate::state::Evaluation;

impl<C: Classifier> EpsilonSearch<C> {
    /// `at_max` is the successful `epsilon_max` evaluation, or `None` when the
    /// classifier failed on it.
    pub(crate) fn bisect(
        &self,
        run: &mut Run<'_>,
        at_max: Option<Evaluation>,
        precision: f64,
        max_iterations: usize,
    ) -> Flow<Conclusion> {
        self.transition(run, SearchPhase::Bisection)?;

        let mut steps = 0;
        let mut found = false;
        while run.state.right() - run.state.left() > precision && steps < max_iterations {
            steps += 1;
            let mid = (run.state.left() + run.state.right()) / 2.0;
            let evaluation = self.evaluate(run, mid)?;
            debug!(
                search_id = %run.id,
                step = steps,
                epsilon = mid,
                succeeded = evaluation.succeeded,
                "Bisection step"
            );
            if evaluation.succeeded {
                found = true;
                run.state.lower_right(mid);
            } else {
                run.state.raise_left(mid);
            }
        }
        info!(
            search_id = %run.id,
            steps,
            left = run.state.left(),
            right = run.state.right(),
            "Bisection converged"
        );

        if !found && !(self.config().anchor_on_probe && at_max.is_some()) {
            let message = "bisection found no reliable flip below epsilon_max".to_string();
            warn!(search_id = %run.id, "{message}");
            run.warnings.push(message);
            self.transition(run, SearchPhase::Infeasible)?;
            let attached = at_max.or_else(|| run.state.take_last());
            return Ok((Verdict::Infeasible, attached));
        }

        let precision = self.config().tighten_precision.unwrap_or(precision);
        self.tighten(run, Some(precision))?;
        self.conclude_success(run)
    }
}
