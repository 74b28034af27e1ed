//! Error taxonomy for the crate.
//!
//! Input-shape problems (malformed newick, ragged character matrices,
//! missing leaves) fail fast at the I/O boundary. Numerical underflow
//! inside the DP is never an error -- it is absorbed by [`crate::logprob::LogProb::MIN`].
//! Optimizer failures (an infeasible M-step, a non-convergent EM run) are
//! reported through `Option`/`Result` at the call site rather than panics,
//! per the EM driver's "return None and let multi-start move on" contract.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LamlError {
    #[error("malformed newick string: {0}")]
    Newick(String),

    #[error("character matrix error: {0}")]
    CharMatrix(String),

    #[error("prior error: {0}")]
    Prior(String),

    #[error("tree/data mismatch: {0}")]
    TreeDataMismatch(String),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("pickle error in {path}: {source}")]
    Pickle {
        path: String,
        #[source]
        source: serde_pickle::Error,
    },

    #[error("optimization failed: {0}")]
    Optimization(String),

    #[error("all {trials} multi-start trials failed to optimize")]
    AllTrialsFailed { trials: usize },
}

pub type Result<T> = std::result::Result<T, LamlError>;
