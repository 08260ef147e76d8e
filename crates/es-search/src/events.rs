//! Progress events streamed to an observer (UI, history log) while a search runs.

use crossbeam_channel::Sender;
use es_types::{SearchId, SearchPhase, Verdict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SearchEvent {
    PhaseChanged {
        search_id: SearchId,
        from: SearchPhase,
        to: SearchPhase,
    },
    CandidateEvaluated {
        search_id: SearchId,
        phase: SearchPhase,
        epsilon: f64,
        label: String,
        confidence: f64,
        succeeded: bool,
    },
    CandidateFailed {
        search_id: SearchId,
        phase: SearchPhase,
        epsilon: f64,
        error: String,
    },
    Finished {
        search_id: SearchId,
        verdict: Verdict,
        epsilon_used: f64,
    },
}

/// Optional channel end; sending never blocks the search.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink(Option<Sender<SearchEvent>>);

impl EventSink {
    pub(crate) fn new(tx: Sender<SearchEvent>) -> Self {
        Self(Some(tx))
    }

    pub(crate) fn emit(&self, event: SearchEvent) {
        if let Some(tx) = &self.0 {
            // Best-effort send; a dropped receiver must not fail the search.
            let _ = tx.try_send(event);
        }
    }
}
