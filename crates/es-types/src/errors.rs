use thiserror::Error;

/// Main error type for the Epsilon Scout system
#[derive(Error, Debug)]
pub enum EsError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised by a classifier or gradient oracle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Inference failed: {message}")]
    Inference { message: String },

    #[error("Oracle returned invalid output: {message}")]
    InvalidOutput { message: String },

    #[error("Oracle output shape {actual:?} does not match input shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Oracle unavailable: {message}")]
    Unavailable { message: String },
}

/// Search-related errors
///
/// Only `DirectionComputation`, `BaselineClassification`, `InvalidConfig`,
/// `Tensor` and `InvalidTransition` ever escape a search. A
/// `CandidateEvaluation` error is recorded in the evaluation trace and the
/// scan moves on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Direction computation failed: {message}")]
    DirectionComputation { message: String },

    #[error("Baseline classification failed: {message}")]
    BaselineClassification { message: String },

    #[error("Candidate evaluation failed at epsilon {epsilon}: {message}")]
    CandidateEvaluation { epsilon: f64, message: String },

    #[error("Invalid search configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("Invalid search transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Tensor construction and arithmetic errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Expected a rank-4 tensor, got rank {rank}")]
    BadRank { rank: usize },

    #[error("Expected batch size 1, got {batch}")]
    BadBatch { batch: usize },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor contains a non-finite value at flat index {index}")]
    NonFinite { index: usize },

    #[error("Direction entry {value} at flat index {index} is not in {{-1, 0, 1}}")]
    NotSignValued { index: usize, value: f32 },
}

/// Result type alias for Epsilon Scout operations
pub type EsResult<T> = Result<T, EsError>;

/// Result alias for oracle calls.
pub type OracleResult<T> = Result<T, OracleError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::EsError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::EsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::EsError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SearchError::CandidateEvaluation {
            epsilon: 0.25,
            message: "model timed out".to_string(),
        };

        assert!(error.to_string().contains("Candidate evaluation failed"));
        assert!(error.to_string().contains("0.25"));
        assert!(error.to_string().contains("model timed out"));
    }

    #[test]
    fn test_error_conversion() {
        let search_error = SearchError::BaselineClassification {
            message: "test".to_string(),
        };
        let es_error: EsError = search_error.into();

        match es_error {
            EsError::Search(SearchError::BaselineClassification { .. }) => (),
            other => panic!("Expected Search error, got {other:?}"),
        }
    }

    #[test]
    fn tensor_error_lifts_into_search_error() {
        let err: SearchError = TensorError::BadBatch { batch: 3 }.into();
        assert!(matches!(err, SearchError::Tensor(TensorError::BadBatch { batch: 3 })));
    }

    #[test]
    fn test_macros() {
        let validation = validation_error!("Invalid epsilon: {}", -1.0);
        assert!(matches!(validation, EsError::Validation(ref m) if m.contains("-1")));
        let _internal = internal_error!("Something went wrong");
        let config = config_error!("Missing required field: {}", "bounds");
        assert!(config.to_string().contains("bounds"));
    }
}
