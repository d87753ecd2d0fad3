//! Retrieval quality evaluation.
//!
//! - [`golden`]: labeled query files
//! - [`metrics`]: hit@k, MRR, bucket aggregation, thresholds
//! - [`harness`]: evaluation runs and artifacts

pub mod golden;
pub mod harness;
pub mod metrics;

pub use golden::{load_golden_queries, Difficulty, GoldenQuery, RetrieverType};
pub use harness::{evaluate, run_eval, EvalReport};
