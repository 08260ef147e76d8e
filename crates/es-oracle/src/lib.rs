//! # es-oracle
//!
//! Boundary between the epsilon search and the model it attacks.
//!
//! Provides the [`Classifier`] and [`GradientOracle`] contracts, the FGSM
//! [`DirectionProvider`] that turns a loss gradient into a sign direction, and
//! a deterministic [`ScriptedOracle`] for tests and dry runs.

mod direction;
mod oracle;
mod scripted;

pub use direction::DirectionProvider;
pub use oracle::{Classifier, GradientOracle};
pub use scripted::{FlipRule, LabelSpec, ScriptedOracle, ScriptedOracleConfig};
