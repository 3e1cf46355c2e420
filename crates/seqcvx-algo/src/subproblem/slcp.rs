//! Mixed log-convex subproblem of SLCP.
//!
//! In `y = ln v` the objective is replaced by its quadratic model around the
//! current point `w`,
//!
//! ```text
//! ½ (y − w)ᵀB (y − w) + gᵀ(y − w)
//! ```
//!
//! with `B` the damped-BFGS curvature. Rows split by shape after
//! convexification: single-term rows are affine in `y`, multi-term rows are
//! log-sum-exp constraints handled by exponential cones. Runtime outputs enter
//! through their local monomial fit, which is affine in `y`.
//!
//! [`LogSumExp`] evaluates each convexified row at the subproblem solution,
//! both for the slack it needs and for the subproblem's own stationarity
//! residual, which is logged at debug level.

use tracing::debug;

use crate::convex::{GeometricProgram, GpObjective, LogTerm, TrustRegion};
use crate::error::SolverResult;
use crate::linalg::{axpy, dot, mat_vec, norm_inf, sub};

use super::{
    log_convex_rows, RuntimeApproximation, SubproblemAssembler, SubproblemInput,
    SubproblemSolution,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct SlcpAssembler;

impl SubproblemAssembler for SlcpAssembler {
    fn solve(&self, input: &SubproblemInput<'_>) -> SolverResult<SubproblemSolution> {
        let problem = input.problem;
        let b = input.curvature;
        let g = &input.evaluation.objective.gradient;
        let linear = sub(g, &mat_vec(b, input.w));

        let constraints = log_convex_rows(input, RuntimeApproximation::LocalMonomial)?;
        let program = GeometricProgram {
            n: problem.len(),
            n_rows: problem.row_count(),
            objective: GpObjective::Quadratic {
                hessian: b.to_vec(),
                linear,
            },
            constraints,
            slack_penalty: problem.options.slack_penalty,
            trust: input.trust_radius.map(|radius| TrustRegion {
                center: input.w.to_vec(),
                radius,
            }),
        };
        let solution = program.solve()?;
        let stationarity = subproblem_stationarity(&program, &solution.y, &solution.multipliers);
        if let Some(residual) = stationarity {
            debug!(residual, "SLCP subproblem stationarity");
        }

        // Report the relaxation each row actually needs at the new point.
        let mut slacks = vec![0.0_f64; problem.row_count()];
        for constraint in &program.constraints {
            let lse = LogSumExp::new(constraint.terms.clone()).value(&solution.y);
            slacks[constraint.row] = slacks[constraint.row].max(lse.max(0.0));
        }

        Ok(SubproblemSolution {
            direction: sub(&solution.y, input.w),
            multipliers: solution.multipliers,
            slacks,
        })
    }
}

/// `‖Hy + l + Σ zᵢ ∇lseᵢ(y)‖∞` of a quadratic-objective program at `y`.
///
/// `None` when the residual is not recoverable from per-row multipliers: a row
/// split into several constraints, a trust region, or a posynomial objective.
pub(crate) fn subproblem_stationarity(
    program: &GeometricProgram,
    y: &[f64],
    multipliers: &[f64],
) -> Option<f64> {
    let GpObjective::Quadratic { hessian, linear } = &program.objective else {
        return None;
    };
    if program.trust.is_some() {
        return None;
    }
    let mut seen = vec![false; program.n_rows];
    let mut residual = axpy(&mat_vec(hessian, y), 1.0, linear);
    for constraint in &program.constraints {
        if std::mem::replace(&mut seen[constraint.row], true) {
            return None;
        }
        let z = constraint.sign * multipliers[constraint.row];
        let gradient = LogSumExp::new(constraint.terms.clone()).gradient(y);
        residual = axpy(&residual, z, &gradient);
    }
    Some(norm_inf(&residual))
}

/// `lse(y) = ln Σₖ exp(aₖ·y + bₖ)`
#[derive(Debug, Clone, PartialEq)]
pub struct LogSumExp {
    terms: Vec<LogTerm>,
}

impl LogSumExp {
    pub fn new(terms: Vec<LogTerm>) -> Self {
        Self { terms }
    }

    /// Exponents shifted by their maximum, and that maximum.
    fn shifted(&self, y: &[f64]) -> (Vec<f64>, f64) {
        let exponents: Vec<f64> = self
            .terms
            .iter()
            .map(|t| dot(&t.exponents, y) + t.log_coefficient)
            .collect();
        let max = exponents.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (exponents, max)
    }

    /// Softmax weights `pₖ = exp(eₖ) / Σ exp(eⱼ)`.
    fn weights(&self, y: &[f64]) -> Vec<f64> {
        let (exponents, max) = self.shifted(y);
        let e: Vec<f64> = exponents.iter().map(|x| (x - max).exp()).collect();
        let total: f64 = e.iter().sum();
        e.iter().map(|x| x / total).collect()
    }

    pub fn value(&self, y: &[f64]) -> f64 {
        if self.terms.is_empty() {
            return f64::NEG_INFINITY;
        }
        let (exponents, max) = self.shifted(y);
        max + exponents.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
    }

    /// `Σₖ pₖ aₖ`
    pub fn gradient(&self, y: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.0; y.len()];
        if self.terms.is_empty() {
            return grad;
        }
        for (p, term) in self.weights(y).iter().zip(&self.terms) {
            for (g, a) in grad.iter_mut().zip(&term.exponents) {
                *g += p * a;
            }
        }
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convex::GpConstraint;

    fn lse() -> LogSumExp {
        LogSumExp::new(vec![
            LogTerm { exponents: vec![1.0, 0.0], log_coefficient: 0.3 },
            LogTerm { exponents: vec![0.5, -2.0], log_coefficient: -0.1 },
            LogTerm { exponents: vec![-1.0, 1.5], log_coefficient: 0.0 },
        ])
    }

    #[test]
    fn test_value_is_stable_for_large_exponents() {
        let f = LogSumExp::new(vec![
            LogTerm { exponents: vec![1.0], log_coefficient: 0.0 },
            LogTerm { exponents: vec![1.0], log_coefficient: 0.0 },
        ]);
        let v = f.value(&[800.0]);
        assert!((v - (800.0 + 2.0_f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_against_finite_differences() {
        let f = lse();
        let y = [0.2, -0.4];
        let g = f.gradient(&y);
        let h = 1e-6;
        for i in 0..2 {
            let mut plus = y;
            let mut minus = y;
            plus[i] += h;
            minus[i] -= h;
            let fd = (f.value(&plus) - f.value(&minus)) / (2.0 * h);
            assert!((g[i] - fd).abs() < 1e-8, "component {i}: {} vs {fd}", g[i]);
        }
    }

    fn bounded_quadratic(constraints: Vec<GpConstraint>) -> GeometricProgram {
        // ½y² − 2y, unconstrained minimum at y = 2
        GeometricProgram {
            n: 1,
            n_rows: 1,
            objective: GpObjective::Quadratic {
                hessian: vec![vec![1.0]],
                linear: vec![-2.0],
            },
            constraints,
            slack_penalty: 1e3,
            trust: None,
        }
    }

    #[test]
    fn test_subproblem_stationarity_at_active_bound() {
        // exp(y − 1) ≤ 1 holds the minimum at y = 1 with z = 1
        let program = bounded_quadratic(vec![GpConstraint {
            terms: vec![LogTerm { exponents: vec![1.0], log_coefficient: -1.0 }],
            row: 0,
            sign: 1.0,
        }]);
        let solution = program.solve().unwrap();
        assert!((solution.y[0] - 1.0).abs() < 1e-5, "y = {}", solution.y[0]);
        assert!((solution.multipliers[0] - 1.0).abs() < 1e-4);

        let residual = subproblem_stationarity(&program, &solution.y, &solution.multipliers);
        assert!(residual.unwrap() < 1e-4, "{residual:?}");
        // Dropping the multiplier leaves the objective gradient
        let bare = subproblem_stationarity(&program, &solution.y, &[0.0]).unwrap();
        assert!((bare - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_subproblem_stationarity_skips_split_rows() {
        let half = |sign: f64| GpConstraint {
            terms: vec![LogTerm { exponents: vec![sign], log_coefficient: -sign }],
            row: 0,
            sign,
        };
        let program = bounded_quadratic(vec![half(1.0), half(-1.0)]);
        assert_eq!(subproblem_stationarity(&program, &[1.0], &[1.0]), None);

        let mut trusted = bounded_quadratic(vec![half(1.0)]);
        trusted.trust = Some(TrustRegion { center: vec![0.0], radius: 1.0 });
        assert_eq!(subproblem_stationarity(&trusted, &[1.0], &[1.0]), None);
    }
}
