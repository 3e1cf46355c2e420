//! Quadratic subproblem of SQP and Logspace-SQP.
//!
//! ```text
//! minimize    ½ dᵀB d + gᵀd + ½ C Σᵢ sᵢ²
//! subject to  rᵢ + aᵢ·d − sᵢ ≤ 0      (inequality rows)
//!             rᵢ + aᵢ·d − sᵢ = 0      (equality rows)
//!             |dⱼ| ≤ Δ                (only on trust-region retries)
//! ```
//!
//! `r` and `a` are the row residuals and gradients in solver coordinates, so
//! the same program serves the linear and the log-space variants. The slack
//! columns keep the program feasible when the linearization is inconsistent;
//! the large weight `C` makes them vanish whenever it is not.

use crate::convex::ConicProblem;
use crate::error::SolverResult;
use crate::evaluation::RowEvaluation;
use crate::problem::RowKind;

use super::{SubproblemAssembler, SubproblemInput, SubproblemSolution};

#[derive(Debug, Clone, Copy, Default)]
pub struct QpAssembler;

impl SubproblemAssembler for QpAssembler {
    fn solve(&self, input: &SubproblemInput<'_>) -> SolverResult<SubproblemSolution> {
        solve_qp_step(
            &input.evaluation.objective.gradient,
            input.curvature,
            &input.evaluation.rows,
            input.problem.options.penalty_constant,
            input.trust_radius,
        )
    }
}

/// Solve the QP subproblem for one set of linearized rows.
pub fn solve_qp_step(
    gradient: &[f64],
    curvature: &[Vec<f64>],
    rows: &[RowEvaluation],
    penalty: f64,
    trust_radius: Option<f64>,
) -> SolverResult<SubproblemSolution> {
    let n = gradient.len();
    let m = rows.len();
    let mut program = ConicProblem::new(n + m);

    program.add_hessian_block(0, curvature);
    for (j, g) in gradient.iter().enumerate() {
        program.add_linear(j, *g);
    }

    for (i, row) in rows.iter().enumerate() {
        let slack = n + i;
        program.add_quadratic(slack, slack, penalty);

        let mut coeffs: Vec<(usize, f64)> = row
            .gradient
            .iter()
            .enumerate()
            .map(|(j, a)| (j, *a))
            .collect();
        coeffs.push((slack, -1.0));
        match row.kind {
            RowKind::Equality => program.push_eq(&coeffs, -row.residual),
            RowKind::Inequality => program.push_leq(&coeffs, -row.residual),
        };
    }

    if let Some(radius) = trust_radius {
        for j in 0..n {
            program.push_leq(&[(j, 1.0)], radius);
            program.push_leq(&[(j, -1.0)], radius);
        }
    }

    let solution = program.solve()?;

    // Rows were pushed first and in order, so row i has dual z[i].
    let slacks = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let s = solution.x[n + i];
            match row.kind {
                RowKind::Equality => s.abs(),
                RowKind::Inequality => s.max(0.0),
            }
        })
        .collect();

    Ok(SubproblemSolution {
        direction: solution.x[..n].to_vec(),
        multipliers: solution.z[..m].to_vec(),
        slacks,
    })
}
