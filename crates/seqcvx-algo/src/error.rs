//! Error type for the sequential solvers.
//!
//! Errors split into two groups:
//!
//! - **recoverable**: an evaluation failed at a trial point, or the convex
//!   backend rejected a subproblem. The line search shrinks the step and the
//!   subproblem is retried under a trust region.
//! - **fatal**: shapes or units are inconsistent, the formulation is invalid,
//!   or the failure happened at the current (unperturbed) iterate.
//!
//! [`SolverError::is_recoverable`] is the only place that decides which is which.

use seqcvx_core::{ConfigurationError, DimensionError, EvaluationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error(transparent)]
    Dimension(#[from] DimensionError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The convex backend proved the subproblem infeasible.
    #[error("Convex subproblem is infeasible: {0}")]
    InfeasibleSubproblem(String),

    /// The convex backend stopped without a trustworthy solution.
    #[error("Convex solver did not converge: {0}")]
    SolverDidNotConverge(String),

    #[error("Line search exhausted after {tries} step-size tries")]
    LineSearchExhausted { tries: usize },

    #[error("Solve was cancelled")]
    Cancelled,

    #[error("Failed to write progress file: {0}")]
    Checkpoint(#[from] std::io::Error),

    #[error("Failed to serialize progress: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SolverError {
    /// Whether a line search or trust-region retry may shrink and try again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SolverError::Evaluation(EvaluationError::Dimension(_)) => false,
            SolverError::Evaluation(EvaluationError::UnknownVariable(_)) => false,
            SolverError::Evaluation(_) => true,
            SolverError::InfeasibleSubproblem(_) | SolverError::SolverDidNotConverge(_) => true,
            _ => false,
        }
    }
}

pub type SolverResult<T> = Result<T, SolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let undefined = SolverError::from(EvaluationError::Undefined {
            expression: "ln(x)".into(),
            reason: "x < 0".into(),
        });
        assert!(undefined.is_recoverable());
        assert!(SolverError::InfeasibleSubproblem("primal infeasible".into()).is_recoverable());
        assert!(SolverError::SolverDidNotConverge("max iterations".into()).is_recoverable());

        let shape = SolverError::from(DimensionError::LengthMismatch {
            context: "jacobian".into(),
            expected: 2,
            found: 3,
        });
        assert!(!shape.is_recoverable());
        assert!(!SolverError::Cancelled.is_recoverable());
        assert!(!SolverError::LineSearchExhausted { tries: 30 }.is_recoverable());
    }
}
