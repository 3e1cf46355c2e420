//! Objective and constraint evaluation in solver coordinates.
//!
//! Each solve mode fixes three conventions:
//!
//! | mode | coordinates `w` | objective | row residual |
//! |------|-----------------|-----------|--------------|
//! | SQP | `w = v` | `f` | `±(lhs − rhs) / scale` |
//! | Logspace-SQP | `w = ln v` | `ln f` | `ln(P/N)` (`ln(N/P)` for `>=`) |
//! | SGP | `w = ln v` | `ln f` | `ln(P/N)` (`ln(N/P)` for `>=`) |
//! | SLCP | `w = ln v` | `f` | `ln(P/N)` (`ln(N/P)` for `>=`) |
//!
//! Every row is oriented so that it is feasible when the residual is `≤ 0`
//! (inequality) or `= 0` (equality). Gradients are always with respect to `w`.
//!
//! Runtime outputs go through the [`RuntimeConstraintBridge`] and their raw
//! evaluations are kept in an [`EvaluationCache`]. The cache remembers the
//! point it was filled at; asking for a different point empties it, which is
//! the only invalidation there is.
//!
//! [`RuntimeConstraintBridge`]: crate::bridge::RuntimeConstraintBridge

use seqcvx_core::{EvaluationError, GradientAccuracy, Operator, SolveMode};

use crate::bridge::{BridgeMode, BridgedResidual, RuntimeEvaluation};
use crate::cancel::CancellationToken;
use crate::error::SolverResult;
use crate::linalg::evaluate_numeric;
use crate::problem::{ExplicitRow, RowKind, RowSource, RowSpec, WorkingProblem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coordinates {
    Linear,
    Log,
}

impl Coordinates {
    /// `v` from `w`.
    pub fn to_point(self, w: &[f64]) -> Vec<f64> {
        match self {
            Coordinates::Linear => w.to_vec(),
            Coordinates::Log => w.iter().map(|w| w.exp()).collect(),
        }
    }

    /// `w` from `v`.
    pub fn from_point(self, v: &[f64]) -> Vec<f64> {
        match self {
            Coordinates::Linear => v.to_vec(),
            Coordinates::Log => v.iter().map(|v| v.ln()).collect(),
        }
    }

    /// Diagonal of `dv/dw`.
    pub fn jacobian_diagonal(self, v: &[f64]) -> Vec<f64> {
        match self {
            Coordinates::Linear => vec![1.0; v.len()],
            Coordinates::Log => v.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveForm {
    Raw,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualForm {
    Difference,
    LogRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convention {
    pub coordinates: Coordinates,
    pub objective: ObjectiveForm,
    pub residual: ResidualForm,
}

impl Convention {
    pub fn for_mode(mode: SolveMode) -> Self {
        match mode {
            SolveMode::Sqp => Self {
                coordinates: Coordinates::Linear,
                objective: ObjectiveForm::Raw,
                residual: ResidualForm::Difference,
            },
            SolveMode::LogspaceSqp | SolveMode::Sgp => Self {
                coordinates: Coordinates::Log,
                objective: ObjectiveForm::Log,
                residual: ResidualForm::LogRatio,
            },
            SolveMode::Slcp => Self {
                coordinates: Coordinates::Log,
                objective: ObjectiveForm::Raw,
                residual: ResidualForm::LogRatio,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveEvaluation {
    pub value: f64,
    pub gradient: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowEvaluation {
    pub residual: f64,
    pub gradient: Vec<f64>,
    pub kind: RowKind,
}

impl RowEvaluation {
    /// `|r|` for equalities, `max(0, r)` for inequalities.
    pub fn violation(&self) -> f64 {
        match self.kind {
            RowKind::Equality => self.residual.abs(),
            RowKind::Inequality => self.residual.max(0.0),
        }
    }
}

/// Objective and every row at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointEvaluation {
    pub objective: ObjectiveEvaluation,
    pub rows: Vec<RowEvaluation>,
}

impl PointEvaluation {
    pub fn violations(&self) -> Vec<f64> {
        self.rows.iter().map(RowEvaluation::violation).collect()
    }

    pub fn max_violation(&self) -> f64 {
        self.rows
            .iter()
            .map(RowEvaluation::violation)
            .fold(0.0, f64::max)
    }
}

/// Raw runtime evaluations at one point, by runtime-constraint index.
#[derive(Debug, Clone, Default)]
pub struct EvaluationCache {
    point: Option<Vec<f64>>,
    runtime: Vec<Option<RuntimeEvaluation>>,
    model_calls: usize,
}

impl EvaluationCache {
    pub fn new(runtime_constraints: usize) -> Self {
        Self {
            point: None,
            runtime: vec![None; runtime_constraints],
            model_calls: 0,
        }
    }

    pub fn point(&self) -> Option<&[f64]> {
        self.point.as_deref()
    }

    /// Point the cache at `v`, emptying it if it held another point.
    ///
    /// Returns `true` when the existing entries were kept.
    pub fn ensure_point(&mut self, v: &[f64]) -> bool {
        if self.point.as_deref() == Some(v) {
            return true;
        }
        self.invalidate();
        self.point = Some(v.to_vec());
        false
    }

    pub fn invalidate(&mut self) {
        self.point = None;
        for slot in &mut self.runtime {
            *slot = None;
        }
    }

    pub fn get(&self, index: usize) -> Option<&RuntimeEvaluation> {
        self.runtime.get(index).and_then(Option::as_ref)
    }

    pub fn get_or_compute<F>(
        &mut self,
        index: usize,
        compute: F,
    ) -> SolverResult<&RuntimeEvaluation>
    where
        F: FnOnce() -> SolverResult<RuntimeEvaluation>,
    {
        if index >= self.runtime.len() {
            self.runtime.resize(index + 1, None);
        }
        let slot = &mut self.runtime[index];
        let evaluation = match slot.take() {
            Some(cached) => cached,
            None => {
                let computed = compute()?;
                self.model_calls += 1;
                computed
            }
        };
        Ok(slot.insert(evaluation))
    }

    /// `(constraint, output)` pairs whose gradients are not fully accurate.
    pub fn degraded_outputs(&self) -> Vec<(usize, usize, GradientAccuracy)> {
        let mut out = Vec::new();
        for (c, slot) in self.runtime.iter().enumerate() {
            if let Some(eval) = slot {
                for (o, accuracy) in eval.accuracy.iter().enumerate() {
                    if accuracy.is_degraded() {
                        out.push((c, o, *accuracy));
                    }
                }
            }
        }
        out
    }

    /// Black-box calls made through this cache since it was created.
    pub fn model_calls(&self) -> usize {
        self.model_calls
    }
}

/// Evaluates a [`WorkingProblem`] in the coordinates of its mode.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    problem: &'a WorkingProblem,
    cancel: &'a CancellationToken,
}

impl<'a> Evaluator<'a> {
    pub fn new(problem: &'a WorkingProblem, cancel: &'a CancellationToken) -> Self {
        Self { problem, cancel }
    }

    pub fn problem(&self) -> &'a WorkingProblem {
        self.problem
    }

    pub fn point_of(&self, w: &[f64]) -> Vec<f64> {
        self.problem.convention.coordinates.to_point(w)
    }

    pub fn objective(&self, w: &[f64]) -> SolverResult<ObjectiveEvaluation> {
        let p = self.problem;
        let v = self.point_of(w);
        let dv = p.convention.coordinates.jacobian_diagonal(&v);
        let f = p.objective.evaluate(&p.space, &v)?;
        let grad = evaluate_numeric(&p.objective_gradient, &p.space, &v)?.into_vector()?;

        match p.convention.objective {
            ObjectiveForm::Raw => Ok(ObjectiveEvaluation {
                value: f,
                gradient: grad.iter().zip(&dv).map(|(g, d)| g * d).collect(),
            }),
            ObjectiveForm::Log => {
                if !(f > 0.0) {
                    return Err(EvaluationError::Undefined {
                        expression: format!("ln({})", p.objective),
                        reason: format!("objective is {f}"),
                    }
                    .into());
                }
                Ok(ObjectiveEvaluation {
                    value: f.ln(),
                    gradient: grad.iter().zip(&dv).map(|(g, d)| g * d / f).collect(),
                })
            }
        }
    }

    /// Every row at `w`, reusing (or filling) the cache for runtime outputs.
    pub fn rows(&self, w: &[f64], cache: &mut EvaluationCache) -> SolverResult<Vec<RowEvaluation>> {
        let p = self.problem;
        let v = self.point_of(w);
        cache.ensure_point(&v);
        let dv = p.convention.coordinates.jacobian_diagonal(&v);
        let bridge = p.bridge();
        let bridge_mode = match p.convention.residual {
            ResidualForm::Difference => BridgeMode::Sqp,
            ResidualForm::LogRatio => BridgeMode::LogRatio,
        };

        let mut bridged: Vec<Option<Vec<BridgedResidual>>> = vec![None; p.runtime.len()];
        let mut out = Vec::with_capacity(p.rows.len());
        for row in &p.rows {
            let (residual, gradient) = match &row.source {
                RowSource::Explicit(explicit) => self.explicit_residual(row, explicit, &v)?,
                RowSource::Runtime { constraint, output } => {
                    if bridged[*constraint].is_none() {
                        let rc = &p.runtime[*constraint];
                        let raw = cache.get_or_compute(*constraint, || {
                            self.cancel.check()?;
                            bridge.raw(rc, &v)
                        })?;
                        bridged[*constraint] = Some(bridge.residuals(rc, raw, &v, bridge_mode)?);
                    }
                    let r = match bridged[*constraint].as_ref().and_then(|b| b.get(*output)) {
                        Some(r) => r,
                        None => {
                            return Err(EvaluationError::UnknownVariable(row.label.clone()).into())
                        }
                    };
                    match p.convention.residual {
                        ResidualForm::Difference => (
                            r.value / row.scale,
                            r.gradient.iter().map(|g| g / row.scale).collect(),
                        ),
                        ResidualForm::LogRatio => (
                            r.value.ln(),
                            r.gradient.iter().map(|g| g / r.value).collect(),
                        ),
                    }
                }
            };
            out.push(RowEvaluation {
                residual,
                gradient: gradient.iter().zip(&dv).map(|(g, d)| g * d).collect::<Vec<f64>>(),
                kind: row.kind,
            });
        }
        Ok(out)
    }

    /// Residual and gradient with respect to `v`.
    fn explicit_residual(
        &self,
        row: &RowSpec,
        explicit: &ExplicitRow,
        v: &[f64],
    ) -> SolverResult<(f64, Vec<f64>)> {
        let p = self.problem;
        let sign = if row.operator == Operator::GreaterEqual { -1.0 } else { 1.0 };
        match p.convention.residual {
            ResidualForm::Difference => {
                let d = explicit.difference.evaluate(&p.space, v)?;
                let grad = evaluate_numeric(&explicit.difference_gradient, &p.space, v)?
                    .into_vector()?;
                let k = sign / row.scale;
                Ok((k * d, grad.iter().map(|g| k * g).collect()))
            }
            ResidualForm::LogRatio => {
                let pos = explicit.positive.evaluate(&p.space, v)?;
                let neg = explicit.negative.evaluate(&p.space, v)?;
                if !(pos > 0.0 && neg > 0.0) {
                    return Err(EvaluationError::Undefined {
                        expression: format!(
                            "ln(({}) / ({}))",
                            explicit.positive, explicit.negative
                        ),
                        reason: format!("ratio sides are {pos} and {neg}"),
                    }
                    .into());
                }
                let dp = evaluate_numeric(&explicit.positive_gradient, &p.space, v)?.into_vector()?;
                let dn = evaluate_numeric(&explicit.negative_gradient, &p.space, v)?.into_vector()?;
                Ok((
                    sign * (pos.ln() - neg.ln()),
                    dp.iter()
                        .zip(&dn)
                        .map(|(a, b)| sign * (a / pos - b / neg))
                        .collect(),
                ))
            }
        }
    }

    pub fn evaluate_point(
        &self,
        w: &[f64],
        cache: &mut EvaluationCache,
    ) -> SolverResult<PointEvaluation> {
        Ok(PointEvaluation {
            objective: self.objective(w)?,
            rows: self.rows(w, cache)?,
        })
    }
}

/// `∇f + Σ λᵢ ∇rᵢ`
pub fn lagrangian_gradient(
    objective_gradient: &[f64],
    rows: &[RowEvaluation],
    multipliers: &[f64],
) -> Vec<f64> {
    let mut grad = objective_gradient.to_vec();
    for (row, lambda) in rows.iter().zip(multipliers) {
        for (g, r) in grad.iter_mut().zip(&row.gradient) {
            *g += lambda * r;
        }
    }
    grad
}

/// Largest of `|λᵢ rᵢ|` over all rows and `max(0, −λᵢ)` over inequality rows.
///
/// Zero exactly when the multipliers are complementary to the residuals and
/// have the sign of a `r ≤ 0` row.
pub fn complementarity_error(rows: &[RowEvaluation], multipliers: &[f64]) -> f64 {
    rows.iter()
        .zip(multipliers)
        .map(|(row, lambda)| {
            let product = (lambda * row.residual).abs();
            match row.kind {
                RowKind::Equality => product,
                RowKind::Inequality => product.max(-lambda),
            }
        })
        .fold(0.0, f64::max)
}
