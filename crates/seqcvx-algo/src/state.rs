//! Iterate state carried between iterations of the sequential loop.
//!
//! Everything a watchdog revert must undo lives in one [`IterateState`], and
//! the checkpoint is a single [`IterateSnapshot`] clone of it together with the
//! subproblem solution and point evaluation it was accepted with. Restoring
//! replaces all of it at once.

use seqcvx_core::SolveMode;

use crate::evaluation::{EvaluationCache, PointEvaluation};
use crate::linalg::identity;
use crate::problem::{RowSource, WorkingProblem};
use crate::subproblem::SubproblemSolution;

#[derive(Debug, Clone)]
pub struct IterateState {
    /// Current point in solver coordinates.
    pub w: Vec<f64>,
    pub multipliers: Vec<f64>,
    /// Merit penalty weights, one per row.
    pub penalties: Vec<f64>,
    /// Lagrangian curvature approximation in solver coordinates.
    pub curvature: Vec<Vec<f64>>,
    /// SR1 curvature of runtime rows in working variables (SGP only).
    pub local_curvature: Vec<Option<Vec<Vec<f64>>>>,
    pub cache: EvaluationCache,
}

impl IterateState {
    pub fn initial(problem: &WorkingProblem) -> Self {
        let n = problem.len();
        let m = problem.row_count();
        let local_curvature = problem
            .rows
            .iter()
            .map(|row| match (&row.source, problem.mode) {
                (RowSource::Runtime { .. }, SolveMode::Sgp) => Some(vec![vec![0.0; n]; n]),
                _ => None,
            })
            .collect();
        Self {
            w: problem.initial_coordinates(),
            multipliers: vec![0.0; m],
            penalties: vec![0.0; m],
            curvature: identity(n),
            local_curvature,
            cache: EvaluationCache::new(problem.runtime.len()),
        }
    }
}

/// Checkpoint taken on the first step accepted without sufficient decrease.
#[derive(Debug, Clone)]
pub struct IterateSnapshot {
    pub state: IterateState,
    pub solution: SubproblemSolution,
    pub current: PointEvaluation,
}
