//! Geometric-program subproblem of SGP.
//!
//! The objective must be a posynomial and is passed through exactly. Rows are
//! convexified around the current point:
//!
//! - explicit rows: `P op N` with the opposite side condensed to a monomial.
//!   GP-compatible rows (monomial on the condensed side) are reproduced
//!   exactly.
//! - runtime rows: a second-order Taylor model of each output in working
//!   variables,
//!
//!   ```text
//!   m̃(v) = m₀ + g·(v − v₀) + ½ (v − v₀)ᵀH(v − v₀)
//!   ```
//!
//!   with `H` the output's SR1 curvature, expanded into a signomial and then
//!   convexified like an explicit row. When that fails (for instance when the
//!   model has no negative part to condense) the local monomial fit is used.

use seqcvx_core::{Constraint, Quantity, RuntimeConstraint, Signomial, Term};

use crate::bridge::{coefficient_unit, RuntimeEvaluation};
use crate::convex::{GeometricProgram, GpConstraint, GpObjective, TrustRegion};
use crate::error::SolverResult;

use super::{
    convexify, log_convex_rows, log_terms, RuntimeApproximation, SubproblemAssembler,
    SubproblemInput, SubproblemSolution,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct GpAssembler;

impl SubproblemAssembler for GpAssembler {
    fn solve(&self, input: &SubproblemInput<'_>) -> SolverResult<SubproblemSolution> {
        let problem = input.problem;
        let objective = GpObjective::Posynomial(log_terms(&problem.objective, &problem.space)?);
        let constraints = log_convex_rows(input, RuntimeApproximation::QuadraticTaylor)?;

        let program = GeometricProgram {
            n: problem.len(),
            n_rows: problem.row_count(),
            objective,
            constraints,
            slack_penalty: problem.options.slack_penalty,
            trust: input.trust_radius.map(|radius| TrustRegion {
                center: input.w.to_vec(),
                radius,
            }),
        };
        let solution = program.solve()?;

        Ok(SubproblemSolution {
            direction: solution
                .y
                .iter()
                .zip(input.w)
                .map(|(y, w)| y - w)
                .collect(),
            multipliers: solution.multipliers,
            slacks: solution.slacks,
        })
    }
}

/// Second-order Taylor model of runtime output `output` as a signomial.
pub(crate) fn taylor_model(
    input: &SubproblemInput<'_>,
    rc: &RuntimeConstraint,
    raw: &RuntimeEvaluation,
    output: usize,
    hessian: Option<&Vec<Vec<f64>>>,
) -> Signomial {
    let space = &input.problem.space;
    let v0 = input.v;
    let n = v0.len();
    let unit = &rc.outputs[output].unit;
    let m0 = raw.values[output].magnitude;
    let g: Vec<f64> = raw.jacobian[output].iter().map(|q| q.magnitude).collect();

    let hv0: Vec<f64> = match hessian {
        Some(h) => h.iter().map(|row| row.iter().zip(v0).map(|(a, b)| a * b).sum()).collect(),
        None => vec![0.0; n],
    };
    let v0_h_v0: f64 = hv0.iter().zip(v0).map(|(a, b)| a * b).sum();
    let g_v0: f64 = g.iter().zip(v0).map(|(a, b)| a * b).sum();

    let mut terms = vec![Term::constant(Quantity::new(
        m0 - g_v0 + 0.5 * v0_h_v0,
        unit.clone(),
    ))];
    let names = space.names();
    for j in 0..n {
        let linear = g[j] - hv0[j];
        if linear != 0.0 {
            terms.push(
                Term::monomial(linear, &[(names[j].as_str(), 1.0)])
                    .with_unit(coefficient_unit(space, unit, &[(j, 1.0)])),
            );
        }
    }
    if let Some(h) = hessian {
        for j in 0..n {
            for k in j..n {
                let coefficient = if j == k { 0.5 * h[j][j] } else { h[j][k] };
                if coefficient == 0.0 {
                    continue;
                }
                let powers = [(names[j].as_str(), 1.0), (names[k].as_str(), 1.0)];
                terms.push(
                    Term::monomial(coefficient, &powers)
                        .with_unit(coefficient_unit(space, unit, &[(j, 1.0), (k, 1.0)])),
                );
            }
        }
    }
    Signomial::from_terms(terms)
}

/// Convexified rows from the Taylor model of one runtime output.
pub(crate) fn taylor_rows(
    input: &SubproblemInput<'_>,
    rc: &RuntimeConstraint,
    raw: &RuntimeEvaluation,
    output: usize,
    hessian: Option<&Vec<Vec<f64>>>,
    row: usize,
) -> SolverResult<Vec<GpConstraint>> {
    let model = taylor_model(input, rc, raw, output, hessian);
    let operator = rc.operators[output];
    let relation =
        Constraint::new(model, operator, rc.outputs[output].target.clone()).to_all_positive();
    convexify(
        &input.problem.space,
        input.v,
        &relation.lhs,
        &relation.rhs,
        operator,
        row,
    )
}
