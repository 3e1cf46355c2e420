//! Convex subproblem assembly, one assembler per solve mode.
//!
//! | mode | assembler | program |
//! |------|-----------|---------|
//! | SQP, Logspace-SQP | [`QpAssembler`] | QP in the step `d` with one penalized slack per row |
//! | SGP | [`GpAssembler`] | exponential-cone GP with convexified signomial and runtime rows |
//! | SLCP | [`SlcpAssembler`] | quadratic objective model with log-sum-exp rows |
//!
//! Every assembler returns a direction in solver coordinates, one multiplier
//! per row (in row order, regardless of how the backend ordered its cones)
//! and one slack per row.
//!
//! The log-space assemblers share [`log_convex_rows`]: every row is written in
//! all-positive form `P op N` and approximated by ratios of a posynomial over
//! a condensed monomial,
//!
//! ```text
//! <=  :  P / N̂ ≤ 1
//! >=  :  N / P̂ ≤ 1
//! ==  :  P / N̂ ≤ 1  and  N / P̂ ≤ 1
//! ```
//!
//! with `N̂`, `P̂` the arithmetic–geometric mean condensations at the current
//! point. An equality thus becomes two opposing inequalities whose
//! multipliers are combined with opposite signs.

mod gp;
mod qp;
mod slcp;

pub use gp::GpAssembler;
pub use qp::{solve_qp_step, QpAssembler};
pub use slcp::{LogSumExp, SlcpAssembler};

use seqcvx_core::{EvaluationError, Operator, Signomial, SolveMode, Term, VariableSpace};

use crate::convex::{GpConstraint, LogTerm};
use crate::error::SolverResult;
use crate::evaluation::{EvaluationCache, PointEvaluation};
use crate::problem::{RowSource, WorkingProblem};

/// Everything an assembler may read at the current iterate.
#[derive(Clone, Copy)]
pub struct SubproblemInput<'a> {
    pub problem: &'a WorkingProblem,
    /// Current point in solver coordinates.
    pub w: &'a [f64],
    /// Current point in working variables.
    pub v: &'a [f64],
    pub evaluation: &'a PointEvaluation,
    /// Lagrangian curvature in solver coordinates.
    pub curvature: &'a [Vec<f64>],
    /// SR1 curvature of each runtime row in working variables (`None` for
    /// explicit rows and modes that do not use it).
    pub local_curvature: &'a [Option<Vec<Vec<f64>>>],
    /// Runtime evaluations at `v`.
    pub cache: &'a EvaluationCache,
    pub trust_radius: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubproblemSolution {
    pub direction: Vec<f64>,
    pub multipliers: Vec<f64>,
    pub slacks: Vec<f64>,
}

pub trait SubproblemAssembler {
    fn solve(&self, input: &SubproblemInput<'_>) -> SolverResult<SubproblemSolution>;
}

pub fn assembler_for(mode: SolveMode) -> Box<dyn SubproblemAssembler> {
    match mode {
        SolveMode::Sqp | SolveMode::LogspaceSqp => Box::new(QpAssembler),
        SolveMode::Sgp => Box::new(GpAssembler),
        SolveMode::Slcp => Box::new(SlcpAssembler),
    }
}

/// How runtime rows are approximated before convexification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuntimeApproximation {
    /// Second-order Taylor model with the row's SR1 curvature, falling back to
    /// the local monomial when it cannot be convexified.
    QuadraticTaylor,
    LocalMonomial,
}

pub(crate) fn log_term(term: &Term, space: &VariableSpace) -> SolverResult<LogTerm> {
    if !(term.coefficient > 0.0) {
        return Err(EvaluationError::Undefined {
            expression: term.to_string(),
            reason: "log-space terms need a positive coefficient".to_string(),
        }
        .into());
    }
    Ok(LogTerm {
        exponents: term.exponent_vector(space)?,
        log_coefficient: term.coefficient.ln(),
    })
}

pub(crate) fn log_terms(expr: &Signomial, space: &VariableSpace) -> SolverResult<Vec<LogTerm>> {
    expr.terms.iter().map(|t| log_term(t, space)).collect()
}

/// `numerator / condensed(denominator) ≤ 1` in log terms.
fn ratio_row(
    space: &VariableSpace,
    v: &[f64],
    numerator: &Signomial,
    denominator: &Signomial,
    row: usize,
    sign: f64,
) -> SolverResult<Option<GpConstraint>> {
    if numerator.is_zero() {
        // 0 ≤ N̂ always holds
        return Ok(None);
    }
    if denominator.is_zero() {
        return Err(EvaluationError::Undefined {
            expression: format!("{numerator} ≤ 0"),
            reason: "a posynomial cannot be bounded by zero".to_string(),
        }
        .into());
    }
    let condensed = denominator.condensed_at(space, v)?;
    let ratio = numerator.divide_by_monomial(&condensed);
    Ok(Some(GpConstraint {
        terms: log_terms(&ratio, space)?,
        row,
        sign,
    }))
}

/// GP rows for one `P op N` relation.
pub(crate) fn convexify(
    space: &VariableSpace,
    v: &[f64],
    positive: &Signomial,
    negative: &Signomial,
    operator: Operator,
    row: usize,
) -> SolverResult<Vec<GpConstraint>> {
    let rows = match operator {
        Operator::LessEqual => vec![ratio_row(space, v, positive, negative, row, 1.0)?],
        Operator::GreaterEqual => vec![ratio_row(space, v, negative, positive, row, 1.0)?],
        Operator::Equal => {
            if positive.is_zero() || negative.is_zero() {
                return Err(EvaluationError::Undefined {
                    expression: format!("{positive} == {negative}"),
                    reason: "both sides of a log-space equality must be non-empty".to_string(),
                }
                .into());
            }
            vec![
                ratio_row(space, v, positive, negative, row, 1.0)?,
                ratio_row(space, v, negative, positive, row, -1.0)?,
            ]
        }
    };
    Ok(rows.into_iter().flatten().collect())
}

/// Convexified rows for the log-space assemblers.
pub(crate) fn log_convex_rows(
    input: &SubproblemInput<'_>,
    runtime: RuntimeApproximation,
) -> SolverResult<Vec<GpConstraint>> {
    let problem = input.problem;
    let space = &problem.space;
    let mut out = Vec::new();
    for (i, row) in problem.rows.iter().enumerate() {
        match &row.source {
            RowSource::Explicit(explicit) => out.extend(convexify(
                space,
                input.v,
                &explicit.positive,
                &explicit.negative,
                row.operator,
                i,
            )?),
            RowSource::Runtime { constraint, output } => {
                let rc = &problem.runtime[*constraint];
                let raw = input.cache.get(*constraint).ok_or_else(|| EvaluationError::Undefined {
                    expression: row.label.clone(),
                    reason: "no runtime evaluation at the current point".to_string(),
                })?;
                let monomial = || -> SolverResult<Vec<GpConstraint>> {
                    let approx = problem.bridge().local_monomial(rc, raw, input.v)?;
                    let positive = approx[*output].to_all_positive();
                    convexify(space, input.v, &positive.lhs, &positive.rhs, row.operator, i)
                };
                let rows = match runtime {
                    RuntimeApproximation::LocalMonomial => monomial()?,
                    RuntimeApproximation::QuadraticTaylor => {
                        let hessian = input.local_curvature.get(i).and_then(Option::as_ref);
                        match gp::taylor_rows(input, rc, raw, *output, hessian, i) {
                            Ok(rows) => rows,
                            Err(e) if e.is_recoverable() => {
                                tracing::debug!(
                                    row = %row.label,
                                    error = %e,
                                    "Taylor model not convexifiable, using local monomial"
                                );
                                monomial()?
                            }
                            Err(e) => return Err(e),
                        }
                    }
                };
                out.extend(rows);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcvx_core::Variable;

    fn space() -> VariableSpace {
        VariableSpace::new(vec![
            Variable::dimensionless("x", 1.0),
            Variable::dimensionless("y", 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_convexify_ge_condenses_positive_side() {
        // x + y >= 1 → 1 / (x + y)^ ≤ 1
        let p = Signomial::variable("x") + Signomial::variable("y");
        let n = Signomial::scalar(1.0);
        let rows = convexify(&space(), &[1.0, 1.0], &p, &n, Operator::GreaterEqual, 3).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row, 3);
        let term = &rows[0].terms[0];
        assert_eq!(term.exponents, vec![-0.5, -0.5]);
        // condensed monomial equals x + y = 2 at the point
        assert!((term.value(&[0.0, 0.0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_convexify_equality_has_opposing_signs() {
        let p = Signomial::monomial(1.0, &[("x", 1.0), ("y", 1.0)]);
        let n = Signomial::scalar(4.0);
        let rows = convexify(&space(), &[2.0, 2.0], &p, &n, Operator::Equal, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sign, 1.0);
        assert_eq!(rows[1].sign, -1.0);
    }

    #[test]
    fn test_convexify_trivial_and_impossible_rows() {
        let p = Signomial::variable("x");
        let zero = Signomial::zero();
        let rows = convexify(&space(), &[1.0, 1.0], &zero, &p, Operator::LessEqual, 0).unwrap();
        assert!(rows.is_empty());
        assert!(convexify(&space(), &[1.0, 1.0], &p, &zero, Operator::LessEqual, 0).is_err());
    }
}
