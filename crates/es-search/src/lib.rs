//! # es-search
//!
//! Finds the smallest FGSM perturbation magnitude that flips a classifier's
//! prediction with enough confidence.
//!
//! The [`EpsilonSearch`] controller probes `epsilon_max`, retries a forced
//! large magnitude when the probe fails, then either scans coarse-to-fine or
//! bisects toward the smallest working epsilon. The [`attack`] module wires the
//! direction provider and controller into a single call.

pub mod attack;
mod bisect;
mod budget;
mod controller;
mod events;
mod grid;
mod state;

pub use attack::{auto_tune, single_shot, AttackReport};
pub use budget::{CancelToken, SearchBudget, StopReason};
pub use controller::EpsilonSearch;
pub use events::SearchEvent;
pub use grid::{fine_window, linear_grid, LinearGrid};
pub use state::{Evaluation, SearchState};
