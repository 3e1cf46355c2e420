//! ℓ₁ penalty merit function.
//!
//! ```text
//! φ(α) = f(w + α d) + Σᵢ μᵢ cᵢ(w + α d)
//! D    = ∇f·d − Σᵢ μᵢ cᵢ(w)
//! ```
//!
//! `cᵢ` is the violation of row `i` in the mode's residual convention (raw
//! difference for SQP, log-ratio otherwise). `D` is the directional derivative
//! used by the sufficient-decrease test.
//!
//! Penalty weights only move on the anchor evaluation (`α = 0`):
//!
//! ```text
//! μᵢ ← max(|λᵢ| + margin, ½(μᵢ + |λᵢ|))
//! ```
//!
//! The anchor evaluation is at the current iterate, whose runtime outputs are
//! already in the cache from the subproblem build, so it never calls a model.

use crate::evaluation::{EvaluationCache, Evaluator, PointEvaluation};
use crate::error::SolverResult;
use crate::linalg::{axpy, dot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeritMode {
    /// `α = 0`; updates the penalty weights.
    Anchor,
    /// Trial step; weights are read only.
    Trial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeritEvaluation {
    pub phi: f64,
    pub derivative: f64,
    /// Point evaluation behind `φ`; absent for hand-built values.
    pub evaluation: Option<PointEvaluation>,
}

impl MeritEvaluation {
    pub fn new(phi: f64, derivative: f64) -> Self {
        Self {
            phi,
            derivative,
            evaluation: None,
        }
    }

    pub fn max_violation(&self) -> f64 {
        self.evaluation
            .as_ref()
            .map_or(0.0, PointEvaluation::max_violation)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MeritRequest<'r> {
    pub step_size: f64,
    pub direction: &'r [f64],
    /// Current iterate in solver coordinates.
    pub point: &'r [f64],
    pub objective_gradient: &'r [f64],
    pub multipliers: &'r [f64],
}

pub struct MeritFunction<'a> {
    evaluator: Evaluator<'a>,
    mu_margin: f64,
}

impl<'a> MeritFunction<'a> {
    pub fn new(evaluator: Evaluator<'a>, mu_margin: f64) -> Self {
        Self {
            evaluator,
            mu_margin,
        }
    }

    pub fn evaluate(
        &self,
        request: &MeritRequest<'_>,
        mode: MeritMode,
        penalties: &mut Vec<f64>,
        cache: &mut EvaluationCache,
    ) -> SolverResult<MeritEvaluation> {
        let point = if request.step_size == 0.0 {
            request.point.to_vec()
        } else {
            axpy(request.point, request.step_size, request.direction)
        };
        let evaluation = self.evaluator.evaluate_point(&point, cache)?;
        let violations = evaluation.violations();

        if penalties.len() != violations.len() {
            penalties.resize(violations.len(), 0.0);
        }
        if mode == MeritMode::Anchor {
            update_penalties(penalties, request.multipliers, self.mu_margin);
        }

        let penalty: f64 = penalties.iter().zip(&violations).map(|(m, c)| m * c).sum();
        let phi = evaluation.objective.value + penalty;
        let derivative = dot(request.objective_gradient, request.direction) - penalty;

        Ok(MeritEvaluation {
            phi,
            derivative,
            evaluation: Some(evaluation),
        })
    }
}

pub fn update_penalties(penalties: &mut [f64], multipliers: &[f64], margin: f64) {
    for (mu, lambda) in penalties.iter_mut().zip(multipliers) {
        let l = lambda.abs();
        *mu = (l + margin).max(0.5 * (*mu + l));
    }
}
