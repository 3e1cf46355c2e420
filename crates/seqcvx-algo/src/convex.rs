//! # Convex Backend Adapter
//!
//! Every subproblem the sequential solvers build ends up here, as a conic
//! program in the form Clarabel solves:
//!
//! ```text
//! minimize    ½ xᵀP x + qᵀx
//! subject to  A x + s = b
//!             s ∈ K
//! ```
//!
//! with `K` a product of zero cones (equalities), nonnegative cones
//! (inequalities) and exponential cones (log-sum-exp rows). The stationarity
//! condition of the solution is `P x + q + Aᵀz = 0`, and `z` holds one dual per
//! row of `A`.
//!
//! ## Building blocks
//!
//! - [`ConicProblem`]: a small builder that accumulates `A` column-wise,
//!   merges consecutive zero and nonnegative cones, and converts to CSC at the
//!   end. It also owns the solution checks: a status the backend reports as
//!   solved is still rejected when the primal or dual residual is out of
//!   tolerance or any entry is non-finite.
//! - [`GeometricProgram`]: log-space programs over `y = ln x` whose rows are
//!   log-sum-exp constraints `ln Σₖ exp(aₖ·y + bₖ) ≤ σ`, with a nonnegative
//!   slack `σ` per row and a linear penalty on the slacks.
//!
//! ## Exponential-cone encoding
//!
//! Clarabel's exponential cone is `{(r, s, t) : s > 0, s·exp(r/s) ≤ t}`. For a
//! posynomial row with terms `exp(aₖ·y + bₖ)` we add one auxiliary `uₖ` per
//! term and require
//!
//! ```text
//! (aₖ·y + bₖ − σ, 1, uₖ) ∈ K_exp      for every k
//! Σₖ uₖ ≤ 1
//! ```
//!
//! which is exactly `Σₖ exp(aₖ·y + bₖ − σ) ≤ 1`. The dual of the `Σ uₖ ≤ 1`
//! row equals the multiplier of `ln Σₖ exp(aₖ·y + bₖ) − σ ≤ 0` when the row is
//! active, which is what the outer loop needs. Single-term rows are affine
//! and skip the cones altogether.
//!
//! ## Fast path
//!
//! A program with only equality rows is a linear KKT system:
//!
//! ```text
//! ⎡ P  Aᵀ ⎤ ⎡x⎤   ⎡−q⎤
//! ⎣ A  0  ⎦ ⎣z⎦ = ⎣ b⎦
//! ```
//!
//! solved directly with a dense LU. Singular systems fall back to Clarabel.
//!
//! ## References
//!
//! - **Boyd, Kim, Vandenberghe & Hassibi (2007)**: "A tutorial on geometric
//!   programming", Optimization and Engineering, 8(1), 67-127
//!   DOI: [10.1007/s11081-007-9001-7](https://doi.org/10.1007/s11081-007-9001-7)
//! - **Goulart & Chen (2024)**: "Clarabel: An interior-point solver for conic
//!   programs with quadratic objectives", arXiv:2405.12762

use clarabel::{
    algebra::CscMatrix,
    solver::{DefaultSettingsBuilder, IPSolver, SolverStatus, SupportedConeT},
};
use tracing::debug;

use crate::error::{SolverError, SolverResult};
use crate::linalg::{norm_inf, solve_dense};

/// Relative residual accepted on a returned solution.
const RESIDUAL_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq)]
pub struct ConicSolution {
    pub x: Vec<f64>,
    /// One dual per row, `z ≥ 0` on inequality rows.
    pub z: Vec<f64>,
    pub s: Vec<f64>,
    pub iterations: usize,
}

/// Incrementally assembled conic program.
#[derive(Debug, Clone, Default)]
pub struct ConicProblem {
    q: Vec<f64>,
    /// Upper triangle of `P`, column-wise `(row, value)`.
    p_columns: Vec<Vec<(usize, f64)>>,
    /// `A`, column-wise `(row, value)`.
    a_columns: Vec<Vec<(usize, f64)>>,
    rhs: Vec<f64>,
    cones: Vec<SupportedConeT<f64>>,
}

impl ConicProblem {
    pub fn new(n_var: usize) -> Self {
        Self {
            q: vec![0.0; n_var],
            p_columns: vec![Vec::new(); n_var],
            a_columns: vec![Vec::new(); n_var],
            rhs: Vec::new(),
            cones: Vec::new(),
        }
    }

    pub fn n_var(&self) -> usize {
        self.q.len()
    }

    pub fn n_rows(&self) -> usize {
        self.rhs.len()
    }

    /// Append a variable, returning its column.
    pub fn add_variable(&mut self) -> usize {
        self.q.push(0.0);
        self.p_columns.push(Vec::new());
        self.a_columns.push(Vec::new());
        self.q.len() - 1
    }

    pub fn add_linear(&mut self, col: usize, coefficient: f64) {
        self.q[col] += coefficient;
    }

    /// Add `value` to `P[i][j]` (and its mirror). Only the upper triangle is
    /// stored, so each off-diagonal pair must be added once.
    pub fn add_quadratic(&mut self, i: usize, j: usize, value: f64) {
        if value == 0.0 {
            return;
        }
        let (row, col) = if i <= j { (i, j) } else { (j, i) };
        self.p_columns[col].push((row, value));
    }

    /// Add a dense symmetric block `H` at `offset`.
    pub fn add_hessian_block(&mut self, offset: usize, hessian: &[Vec<f64>]) {
        for (j, column) in hessian.iter().enumerate() {
            for i in 0..=j {
                let value = 0.5 * (hessian[i][j] + column[i]);
                self.add_quadratic(offset + i, offset + j, value);
            }
        }
    }

    fn push_row(&mut self, coeffs: &[(usize, f64)], b: f64) -> usize {
        let row = self.rhs.len();
        for &(col, val) in coeffs {
            if val != 0.0 {
                self.a_columns[col].push((row, val));
            }
        }
        self.rhs.push(b);
        row
    }

    /// `Σ coeffᵢ·xᵢ = b`
    pub fn push_eq(&mut self, coeffs: &[(usize, f64)], b: f64) -> usize {
        let row = self.push_row(coeffs, b);
        match self.cones.last_mut() {
            Some(SupportedConeT::ZeroConeT(n)) => *n += 1,
            _ => self.cones.push(SupportedConeT::ZeroConeT(1)),
        }
        row
    }

    /// `Σ coeffᵢ·xᵢ ≤ b`
    pub fn push_leq(&mut self, coeffs: &[(usize, f64)], b: f64) -> usize {
        let row = self.push_row(coeffs, b);
        match self.cones.last_mut() {
            Some(SupportedConeT::NonnegativeConeT(n)) => *n += 1,
            _ => self.cones.push(SupportedConeT::NonnegativeConeT(1)),
        }
        row
    }

    /// `b − A x ∈ K_exp` for three consecutive rows.
    pub fn push_exp(&mut self, rows: [&[(usize, f64)]; 3], b: [f64; 3]) -> usize {
        let first = self.push_row(rows[0], b[0]);
        self.push_row(rows[1], b[1]);
        self.push_row(rows[2], b[2]);
        self.cones.push(SupportedConeT::ExponentialConeT());
        first
    }

    fn only_equalities(&self) -> bool {
        self.cones
            .iter()
            .all(|c| matches!(c, SupportedConeT::ZeroConeT(_)))
    }

    pub fn solve(&self) -> SolverResult<ConicSolution> {
        if self.only_equalities() {
            if let Some(solution) = self.solve_kkt()? {
                return Ok(solution);
            }
            debug!("KKT system singular, falling back to the conic solver");
        }
        self.solve_conic()
    }

    fn dense_p(&self) -> Vec<Vec<f64>> {
        let n = self.n_var();
        let mut p = vec![vec![0.0; n]; n];
        for (col, entries) in self.p_columns.iter().enumerate() {
            for &(row, val) in entries {
                p[row][col] += val;
                if row != col {
                    p[col][row] += val;
                }
            }
        }
        p
    }

    fn solve_kkt(&self) -> SolverResult<Option<ConicSolution>> {
        let n = self.n_var();
        let m = self.n_rows();
        let p = self.dense_p();
        let mut kkt = vec![vec![0.0; n + m]; n + m];
        for i in 0..n {
            kkt[i][..n].copy_from_slice(&p[i]);
        }
        for (col, entries) in self.a_columns.iter().enumerate() {
            for &(row, val) in entries {
                kkt[n + row][col] += val;
                kkt[col][n + row] += val;
            }
        }
        let mut rhs: Vec<f64> = self.q.iter().map(|q| -q).collect();
        rhs.extend_from_slice(&self.rhs);

        let Some(sol) = solve_dense(&kkt, &rhs)? else {
            return Ok(None);
        };
        let solution = ConicSolution {
            x: sol[..n].to_vec(),
            z: sol[n..].to_vec(),
            s: vec![0.0; m],
            iterations: 0,
        };
        if self.residuals_ok(&solution) {
            Ok(Some(solution))
        } else {
            Ok(None)
        }
    }

    /// Primal and dual residual check on a candidate solution.
    fn residuals_ok(&self, sol: &ConicSolution) -> bool {
        if sol
            .x
            .iter()
            .chain(&sol.z)
            .chain(&sol.s)
            .any(|v| !v.is_finite())
        {
            return false;
        }

        // A x + s − b
        let mut primal: Vec<f64> = sol.s.iter().zip(&self.rhs).map(|(s, b)| s - b).collect();
        // P x + q + Aᵀ z
        let mut dual = self.q.clone();
        let mut scale_dual = norm_inf(&self.q);
        for (col, entries) in self.a_columns.iter().enumerate() {
            for &(row, val) in entries {
                primal[row] += val * sol.x[col];
                dual[col] += val * sol.z[row];
                scale_dual = scale_dual.max((val * sol.z[row]).abs());
            }
        }
        for (col, entries) in self.p_columns.iter().enumerate() {
            for &(row, val) in entries {
                dual[row] += val * sol.x[col];
                scale_dual = scale_dual.max((val * sol.x[col]).abs());
                if row != col {
                    dual[col] += val * sol.x[row];
                    scale_dual = scale_dual.max((val * sol.x[row]).abs());
                }
            }
        }
        let scale_primal = 1.0 + norm_inf(&self.rhs) + norm_inf(&sol.s);
        norm_inf(&primal) <= RESIDUAL_TOLERANCE * scale_primal
            && norm_inf(&dual) <= RESIDUAL_TOLERANCE * (1.0 + scale_dual)
    }

    fn to_csc(columns: &[Vec<(usize, f64)>], n_rows: usize) -> CscMatrix<f64> {
        let n_cols = columns.len();
        let mut col_ptr = Vec::with_capacity(n_cols + 1);
        let mut row_idx = Vec::new();
        let mut values = Vec::new();

        for column in columns {
            let start = row_idx.len();
            col_ptr.push(start);
            let mut sorted = column.clone();
            sorted.sort_by_key(|(r, _)| *r);
            for (r, v) in sorted {
                // One entry per (row, col): merge repeats
                if row_idx.len() > start && row_idx.last() == Some(&r) {
                    if let Some(last) = values.last_mut() {
                        *last += v;
                    }
                } else {
                    row_idx.push(r);
                    values.push(v);
                }
            }
        }
        col_ptr.push(row_idx.len());
        CscMatrix::new(n_rows, n_cols, col_ptr, row_idx, values)
    }

    fn solve_conic(&self) -> SolverResult<ConicSolution> {
        let n = self.n_var();
        let a_mat = Self::to_csc(&self.a_columns, self.n_rows());
        let p_mat = Self::to_csc(&self.p_columns, n);

        let settings = DefaultSettingsBuilder::default()
            .verbose(false)
            .build()
            .map_err(|e| {
                SolverError::SolverDidNotConverge(format!("Clarabel settings error: {e:?}"))
            })?;

        let mut solver = clarabel::solver::DefaultSolver::new(
            &p_mat,
            &self.q,
            &a_mat,
            &self.rhs,
            &self.cones,
            settings,
        )
        .map_err(|e| {
            SolverError::SolverDidNotConverge(format!("Clarabel initialization failed: {e:?}"))
        })?;

        solver.solve();

        let sol = solver.solution;
        match sol.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {}
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                return Err(SolverError::InfeasibleSubproblem(format!(
                    "Clarabel returned status {:?}",
                    sol.status
                )));
            }
            other => {
                return Err(SolverError::SolverDidNotConverge(format!(
                    "Clarabel returned status {other:?}"
                )));
            }
        }

        let solution = ConicSolution {
            x: sol.x.clone(),
            z: sol.z.clone(),
            s: sol.s.clone(),
            iterations: sol.iterations as usize,
        };
        if !self.residuals_ok(&solution) {
            return Err(SolverError::SolverDidNotConverge(format!(
                "Clarabel reported {:?} but the solution fails the residual check",
                sol.status
            )));
        }
        debug!(iterations = solution.iterations, "conic subproblem solved");
        Ok(solution)
    }
}

// ============================================================================
// Geometric programs in log space
// ============================================================================

/// `exp(a·y + b)`: one posynomial term in log coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LogTerm {
    pub exponents: Vec<f64>,
    pub log_coefficient: f64,
}

impl LogTerm {
    pub fn value(&self, y: &[f64]) -> f64 {
        (crate::linalg::dot(&self.exponents, y) + self.log_coefficient).exp()
    }
}

/// `ln Σₖ exp(aₖ·y + bₖ) ≤ σ`, contributing `sign · dual` to multiplier `row`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpConstraint {
    pub terms: Vec<LogTerm>,
    pub row: usize,
    pub sign: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpObjective {
    /// `ln Σₖ exp(aₖ·y + bₖ)`
    Posynomial(Vec<LogTerm>),
    /// `½ yᵀH y + lᵀy`
    Quadratic { hessian: Vec<Vec<f64>>, linear: Vec<f64> },
}

/// Optional box `|yⱼ − centerⱼ| ≤ radius`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustRegion {
    pub center: Vec<f64>,
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeometricProgram {
    pub n: usize,
    pub n_rows: usize,
    pub objective: GpObjective,
    pub constraints: Vec<GpConstraint>,
    pub slack_penalty: f64,
    pub trust: Option<TrustRegion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpSolution {
    pub y: Vec<f64>,
    /// One multiplier per outer row.
    pub multipliers: Vec<f64>,
    /// Largest slack `σ` used by each outer row.
    pub slacks: Vec<f64>,
}

impl GeometricProgram {
    pub fn solve(&self) -> SolverResult<GpSolution> {
        let n = self.n;
        let mut program = ConicProblem::new(n);

        // --------------------------------------------------------------------
        // Objective
        // --------------------------------------------------------------------
        match &self.objective {
            GpObjective::Posynomial(terms) if terms.len() == 1 => {
                for (j, a) in terms[0].exponents.iter().enumerate() {
                    program.add_linear(j, *a);
                }
            }
            GpObjective::Posynomial(terms) => {
                let tau = program.add_variable();
                program.add_linear(tau, 1.0);
                push_log_sum_exp(&mut program, terms, tau);
            }
            GpObjective::Quadratic { hessian, linear } => {
                program.add_hessian_block(0, hessian);
                for (j, l) in linear.iter().enumerate() {
                    program.add_linear(j, *l);
                }
            }
        }

        // --------------------------------------------------------------------
        // Constraints with penalized slacks
        // --------------------------------------------------------------------
        let mut dual_rows = Vec::with_capacity(self.constraints.len());
        let mut slack_cols = Vec::with_capacity(self.constraints.len());
        for constraint in &self.constraints {
            let sigma = program.add_variable();
            program.add_linear(sigma, self.slack_penalty);
            slack_cols.push(sigma);

            let row = match constraint.terms.as_slice() {
                [] => None,
                [single] => {
                    // a·y + b − σ ≤ 0
                    let mut coeffs: Vec<(usize, f64)> = single
                        .exponents
                        .iter()
                        .enumerate()
                        .map(|(j, a)| (j, *a))
                        .collect();
                    coeffs.push((sigma, -1.0));
                    Some(program.push_leq(&coeffs, -single.log_coefficient))
                }
                terms => Some(push_log_sum_exp(&mut program, terms, sigma)),
            };
            dual_rows.push(row);
        }
        for &sigma in &slack_cols {
            program.push_leq(&[(sigma, -1.0)], 0.0);
        }

        if let Some(trust) = &self.trust {
            for j in 0..n {
                program.push_leq(&[(j, 1.0)], trust.center[j] + trust.radius);
                program.push_leq(&[(j, -1.0)], trust.radius - trust.center[j]);
            }
        }

        let solution = program.solve()?;

        let mut multipliers = vec![0.0; self.n_rows];
        let mut slacks = vec![0.0_f64; self.n_rows];
        for ((constraint, row), sigma) in self.constraints.iter().zip(&dual_rows).zip(&slack_cols) {
            if let Some(row) = row {
                multipliers[constraint.row] += constraint.sign * solution.z[*row];
            }
            slacks[constraint.row] = slacks[constraint.row].max(solution.x[*sigma]);
        }

        Ok(GpSolution {
            y: solution.x[..n].to_vec(),
            multipliers,
            slacks,
        })
    }
}

/// `Σₖ exp(aₖ·y + bₖ − t) ≤ 1` through one exponential cone per term.
///
/// Returns the row of `Σ uₖ ≤ 1`.
fn push_log_sum_exp(program: &mut ConicProblem, terms: &[LogTerm], t: usize) -> usize {
    let mut sum = Vec::with_capacity(terms.len());
    for term in terms {
        let u = program.add_variable();
        sum.push((u, 1.0));
        let mut first: Vec<(usize, f64)> = term
            .exponents
            .iter()
            .enumerate()
            .filter(|(_, a)| **a != 0.0)
            .map(|(j, a)| (j, -a))
            .collect();
        first.push((t, 1.0));
        program.push_exp(
            [first.as_slice(), &[], &[(u, -1.0)]],
            [term.log_coefficient, 1.0, 0.0],
        );
    }
    program.push_leq(&sum, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_qp_uses_kkt() {
        // min ½(x² + y²) s.t. x + y = 1
        let mut program = ConicProblem::new(2);
        program.add_quadratic(0, 0, 1.0);
        program.add_quadratic(1, 1, 1.0);
        program.push_eq(&[(0, 1.0), (1, 1.0)], 1.0);
        let sol = program.solve().unwrap();
        assert_eq!(sol.iterations, 0);
        assert!((sol.x[0] - 0.5).abs() < 1e-12);
        assert!((sol.x[1] - 0.5).abs() < 1e-12);
        // x + z = 0
        assert!((sol.z[0] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_inequality_qp_dual_sign() {
        // min ½(x² + y²) − 2x − 2y s.t. x + y ≤ 1
        let mut program = ConicProblem::new(2);
        program.add_quadratic(0, 0, 1.0);
        program.add_quadratic(1, 1, 1.0);
        program.add_linear(0, -2.0);
        program.add_linear(1, -2.0);
        program.push_leq(&[(0, 1.0), (1, 1.0)], 1.0);
        let sol = program.solve().unwrap();
        assert!((sol.x[0] - 0.5).abs() < 1e-6);
        assert!((sol.z[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_program() {
        let mut program = ConicProblem::new(1);
        program.add_quadratic(0, 0, 1.0);
        program.push_leq(&[(0, 1.0)], -1.0);
        program.push_leq(&[(0, -1.0)], -1.0);
        let err = program.solve().unwrap_err();
        assert!(matches!(err, SolverError::InfeasibleSubproblem(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_posynomial_objective_gp() {
        // min ln(x + 1/x) over y = ln x → x = 1
        let gp = GeometricProgram {
            n: 1,
            n_rows: 0,
            objective: GpObjective::Posynomial(vec![
                LogTerm { exponents: vec![1.0], log_coefficient: 0.0 },
                LogTerm { exponents: vec![-1.0], log_coefficient: 0.0 },
            ]),
            constraints: vec![],
            slack_penalty: 1e3,
            trust: None,
        };
        let sol = gp.solve().unwrap();
        assert!(sol.y[0].abs() < 1e-4);
    }

    #[test]
    fn test_gp_multipliers_match_kkt() {
        // min ln(1/x) s.t. ln(x/2) ≤ 0 → x = 2, λ = 1
        let gp = GeometricProgram {
            n: 1,
            n_rows: 1,
            objective: GpObjective::Posynomial(vec![LogTerm {
                exponents: vec![-1.0],
                log_coefficient: 0.0,
            }]),
            constraints: vec![GpConstraint {
                terms: vec![LogTerm {
                    exponents: vec![1.0],
                    log_coefficient: -(2.0_f64.ln()),
                }],
                row: 0,
                sign: 1.0,
            }],
            slack_penalty: 1e3,
            trust: None,
        };
        let sol = gp.solve().unwrap();
        assert!((sol.y[0] - 2.0_f64.ln()).abs() < 1e-5);
        assert!((sol.multipliers[0] - 1.0).abs() < 1e-5);
        assert!(sol.slacks[0] < 1e-6);
    }

    #[test]
    fn test_gp_two_term_constraint_and_trust() {
        // min ln(1/(x·y)) s.t. ln(x + y) ≤ ln 2 → x = y = 1
        let gp = GeometricProgram {
            n: 2,
            n_rows: 1,
            objective: GpObjective::Posynomial(vec![LogTerm {
                exponents: vec![-1.0, -1.0],
                log_coefficient: 0.0,
            }]),
            constraints: vec![GpConstraint {
                terms: vec![
                    LogTerm { exponents: vec![1.0, 0.0], log_coefficient: -(2.0_f64.ln()) },
                    LogTerm { exponents: vec![0.0, 1.0], log_coefficient: -(2.0_f64.ln()) },
                ],
                row: 0,
                sign: 1.0,
            }],
            slack_penalty: 1e3,
            trust: None,
        };
        let sol = gp.solve().unwrap();
        assert!(sol.y[0].abs() < 1e-4 && sol.y[1].abs() < 1e-4);
        // ∇(−y₁−y₂) + λ·(½, ½) = 0 → λ = 2
        assert!((sol.multipliers[0] - 2.0).abs() < 1e-3);

        let boxed = GeometricProgram {
            trust: Some(TrustRegion { center: vec![-1.0, -1.0], radius: 0.5 }),
            ..gp
        };
        let sol = boxed.solve().unwrap();
        assert!((sol.y[0] + 0.5).abs() < 1e-4);
    }
}
