//! Expectation-maximization engine
//!
//! - [`accumulators`]: per-worker partial sums and their reduction
//! - [`expectation`]: per-image scoring, weighting and accumulation
//! - [`parallel`]: static partitioning over a rayon pool
//! - [`maximization`]: new references and parameters from the sums
//! - [`regularization`]: coverage-dependent damping schedule
//! - [`convergence`]: relative change tracking

pub mod accumulators;
pub mod convergence;
pub mod expectation;
pub mod maximization;
pub mod parallel;
pub mod regularization;

pub use accumulators::{reduce_partials, Accumulators, PartialResult};
pub use convergence::ConvergenceTracker;
pub use expectation::{ExpectationContext, ExpectationParams, SIGNIFICANT_WEIGHT_LOW};
pub use maximization::{maximization, MaximizationParams, ModelUpdate};
pub use parallel::{expectation, WorkerTask};
pub use regularization::RegularizationController;
