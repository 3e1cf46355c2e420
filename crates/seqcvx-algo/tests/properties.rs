//! Randomized and structural property checks
//!
//! Tests cover:
//! - QP subproblem step against a hand-assembled KKT solve
//! - Damped BFGS keeps the curvature symmetric positive definite
//! - Watchdog tolerates a bounded run of non-decreasing steps, then reverts once
//! - Runtime Jacobian scatter into global variable order
//! - Log-space SQP agrees with plain SQP
//! - A stationary starting point terminates with a zero step
//! - Multipliers of rows inactive at the start never stop the solve there

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use seqcvx_algo::evaluation::RowEvaluation;
use seqcvx_algo::problem::RowKind;
use seqcvx_algo::{
    damped_bfgs_update, solve, subproblem::solve_qp_step, Acceptance, LineSearchProblem,
    MeritEvaluation, RuntimeConstraintBridge, SolverResult, WatchdogLineSearch,
};
use seqcvx_core::{
    AnalysisModel, Constraint, ConstraintRow, ConvergenceCriterion, Formulation, ModelEvaluation,
    Operator, Quantity, RuntimeConstraint, RuntimeOutput, Signomial, SolveMode, SolverOptions,
    TerminationStatus, Unit, Variable, VariableSpace,
};

// ============================================================================
// Helpers
// ============================================================================

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<Vec<f64>> {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

/// `MᵀM + I`
fn random_spd(rng: &mut StdRng, n: usize) -> Vec<Vec<f64>> {
    let m = random_matrix(rng, n, n);
    let mut b = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            b[i][j] = (0..n).map(|k| m[k][i] * m[k][j]).sum::<f64>();
        }
        b[i][i] += 1.0;
    }
    b
}

/// Gaussian elimination with partial pivoting.
fn gauss_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().partial_cmp(&a[j][col].abs()).unwrap())
            .unwrap();
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x
}

fn is_positive_definite(b: &[Vec<f64>]) -> bool {
    let n = b.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = b[i][i] - sum;
                if !(d > 0.0) {
                    return false;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (b[i][j] - sum) / l[j][j];
            }
        }
    }
    true
}

fn quadratic_objective() -> Signomial {
    Signomial::monomial(1.0, &[("x", 2.0)]) + Signomial::monomial(1.0, &[("y", 2.0)])
}

fn scenario_a(options: SolverOptions, x0: f64, y0: f64) -> Formulation {
    let sum = Signomial::variable("x") + Signomial::variable("y");
    Formulation::new(
        vec![Variable::dimensionless("x", x0), Variable::dimensionless("y", y0)],
        quadratic_objective(),
        vec![Constraint::ge(sum, Signomial::scalar(1.0)).into()],
        options,
    )
    .unwrap()
}

// ============================================================================
// QP subproblem against the KKT system
// ============================================================================

#[test]
fn test_qp_step_matches_kkt_solve() {
    let mut rng = StdRng::seed_from_u64(7);
    let penalty = 1e9;

    for _ in 0..20 {
        let n = 4;
        let m = 2;
        let b = random_spd(&mut rng, n);
        let a = random_matrix(&mut rng, m, n);
        let g: Vec<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let r: Vec<f64> = (0..m).map(|_| rng.gen_range(-0.5..0.5)).collect();

        let rows: Vec<RowEvaluation> = (0..m)
            .map(|i| RowEvaluation {
                residual: r[i],
                gradient: a[i].clone(),
                kind: RowKind::Equality,
            })
            .collect();
        let step = solve_qp_step(&g, &b, &rows, penalty, None).unwrap();

        // ⎡B Aᵀ⎤ ⎡d⎤   ⎡−g⎤
        // ⎣A 0 ⎦ ⎣λ⎦ = ⎣−r⎦
        let mut kkt = vec![vec![0.0; n + m]; n + m];
        let mut rhs = vec![0.0; n + m];
        for i in 0..n {
            kkt[i][..n].copy_from_slice(&b[i]);
            rhs[i] = -g[i];
        }
        for i in 0..m {
            for j in 0..n {
                kkt[n + i][j] = a[i][j];
                kkt[j][n + i] = a[i][j];
            }
            rhs[n + i] = -r[i];
        }
        let expected = gauss_solve(kkt, rhs);

        for j in 0..n {
            assert!(
                (step.direction[j] - expected[j]).abs() < 1e-6,
                "d[{j}]: {} vs {}",
                step.direction[j],
                expected[j]
            );
        }
        for i in 0..m {
            let lambda = expected[n + i];
            assert!(
                (step.multipliers[i] - lambda).abs() < 1e-6 * lambda.abs().max(1.0),
                "λ[{i}]: {} vs {lambda}",
                step.multipliers[i]
            );
        }
    }
}

#[test]
fn test_qp_step_ignores_inactive_inequality() {
    // Identity curvature, one equality and one far-from-active inequality
    let rows = vec![
        RowEvaluation {
            residual: 0.5,
            gradient: vec![1.0, 1.0],
            kind: RowKind::Equality,
        },
        RowEvaluation {
            residual: -100.0,
            gradient: vec![1.0, -1.0],
            kind: RowKind::Inequality,
        },
    ];
    let identity = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
    let step = solve_qp_step(&[1.0, 0.0], &identity, &rows, 1e6, None).unwrap();

    // d = −g − λa with d₁ + d₂ = −0.5  →  λ = −0.25, d = (−0.75, 0.25)
    assert!((step.direction[0] + 0.75).abs() < 1e-4);
    assert!((step.direction[1] - 0.25).abs() < 1e-4);
    assert!((step.multipliers[0] + 0.25).abs() < 1e-4);
    assert!(step.multipliers[1].abs() < 1e-4);
}

// ============================================================================
// Damped BFGS
// ============================================================================

#[test]
fn test_damped_bfgs_stays_positive_definite() {
    let mut rng = StdRng::seed_from_u64(42);
    let n = 5;
    let mut negative_curvature_pairs = 0;

    for _ in 0..200 {
        let b = random_spd(&mut rng, n);
        let s: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let s_y: f64 = s.iter().zip(&y).map(|(a, b)| a * b).sum();
        if s_y < 0.0 {
            negative_curvature_pairs += 1;
        }

        let (next, _) = damped_bfgs_update(&b, &s, &y, 0.2);
        for i in 0..n {
            for j in 0..n {
                assert!((next[i][j] - next[j][i]).abs() < 1e-12 * next[i][j].abs().max(1.0));
            }
        }
        assert!(is_positive_definite(&next), "lost definiteness after sᵀy = {s_y}");
    }
    assert!(negative_curvature_pairs > 0);
}

// ============================================================================
// Watchdog
// ============================================================================

/// Reports no decrease for the first `failures` trials, then decrease.
struct StubMerit {
    failures: usize,
    trials: usize,
    position: usize,
    restores: usize,
}

impl StubMerit {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            trials: 0,
            position: 0,
            restores: 0,
        }
    }
}

impl LineSearchProblem for StubMerit {
    type Checkpoint = usize;

    fn anchor(&mut self) -> SolverResult<MeritEvaluation> {
        Ok(MeritEvaluation::new(1.0, -1.0))
    }

    fn trial(&mut self, _step: f64) -> SolverResult<MeritEvaluation> {
        self.trials += 1;
        let phi = if self.trials <= self.failures { 2.0 } else { 0.5 };
        Ok(MeritEvaluation::new(phi, -1.0))
    }

    fn checkpoint(&self) -> usize {
        self.position
    }

    fn restore(&mut self, checkpoint: usize) {
        self.position = checkpoint;
        self.restores += 1;
    }

    fn log(&mut self, _message: String) {}
}

#[test]
fn test_watchdog_reverts_exactly_once() {
    let window = 3;
    let mut stub = StubMerit::new(window + 1);
    let mut search = WatchdogLineSearch::new(1e-4, 0.5, 30, window);

    for expected in 1..=window {
        let outcome = search.search(&mut stub).unwrap();
        assert_eq!(outcome.acceptance, Acceptance::Tentative);
        assert_eq!(search.counter(), expected);
        stub.position += 1;
    }
    assert!(search.has_checkpoint());
    assert_eq!(stub.restores, 0);

    let outcome = search.search(&mut stub).unwrap();
    assert!(outcome.reverted);
    assert_eq!(outcome.acceptance, Acceptance::SufficientDecrease);
    assert_eq!(outcome.step_size, 1.0);
    assert_eq!(stub.restores, 1);
    // Back at the iterate before the first tentative step
    assert_eq!(stub.position, 0);
    assert_eq!(search.counter(), 0);
    assert!(!search.has_checkpoint());

    stub.position += 1;
    let outcome = search.search(&mut stub).unwrap();
    assert!(!outcome.reverted);
    assert_eq!(stub.restores, 1);
    assert_eq!(search.reverts(), 1);
}

#[test]
fn test_watchdog_shrinks_after_revert() {
    let window = 2;
    let mut stub = StubMerit::new(window + 2);
    let mut search = WatchdogLineSearch::new(1e-4, 0.5, 30, window);

    for _ in 0..window {
        search.search(&mut stub).unwrap();
    }
    let outcome = search.search(&mut stub).unwrap();
    assert!(outcome.reverted);
    assert_eq!(outcome.step_size, 0.5);
    assert_eq!(stub.restores, 1);
}

// ============================================================================
// Runtime scatter
// ============================================================================

#[test]
fn test_runtime_jacobian_scatter() {
    let metre = Unit::base("m");
    let second = Unit::base("s");
    let newton = Unit::base("N");
    let space = VariableSpace::new(vec![
        Variable::new("x", 1.0, metre.clone()),
        Variable::new("t", 2.0, second.clone()),
        Variable::new("z", 3.0, metre.clone()),
    ])
    .unwrap();

    let jac_unit = &newton / &second;
    let model: Arc<dyn AnalysisModel> =
        Arc::new(move |x: &[Quantity]| -> anyhow::Result<ModelEvaluation> {
            Ok(ModelEvaluation::new(
                vec![Quantity::new(5.0 * x[0].magnitude, Unit::base("N"))],
                vec![vec![Quantity::new(5.0, jac_unit.clone())]],
            ))
        });
    let rc = RuntimeConstraint::new(
        "force",
        vec!["t".into()],
        vec![RuntimeOutput::new(
            "f",
            newton.clone(),
            Signomial::constant(Quantity::new(1.0, newton.clone())),
        )],
        vec![Operator::LessEqual],
        model,
    )
    .unwrap();

    let raw = RuntimeConstraintBridge::new(&space).raw(&rc, &[1.0, 2.0, 3.0]).unwrap();
    let row = &raw.jacobian[0];
    assert_eq!(row.len(), 3);
    assert_eq!(row[0], Quantity::new(0.0, &newton / &metre));
    assert_eq!(row[1], Quantity::new(5.0, &newton / &second));
    assert_eq!(row[2], Quantity::new(0.0, &newton / &metre));
    assert_eq!(raw.values[0].magnitude, 10.0);
}

// ============================================================================
// Log-space consistency
// ============================================================================

#[test]
fn test_logspace_sqp_agrees_with_sqp() {
    let sqp = solve(&scenario_a(SolverOptions::with_mode(SolveMode::Sqp), 2.0, 2.0)).unwrap();
    let lsqp =
        solve(&scenario_a(SolverOptions::with_mode(SolveMode::LogspaceSqp), 2.0, 2.0)).unwrap();
    assert!(sqp.is_converged(), "{:?}", sqp.messages);
    assert!(lsqp.is_converged(), "{:?}", lsqp.messages);

    for name in ["x", "y"] {
        let a = sqp.variable(name).unwrap().magnitude;
        let b = lsqp.variable(name).unwrap().magnitude;
        assert!((a - b).abs() < 1e-3, "{name}: {a} vs {b}");
    }

    // Both first steps move toward the constraint from the same side
    let first = |out: &seqcvx_core::OptimizationOutput| {
        out.design_points[1][0] - out.design_points[0][0]
    };
    assert!(first(&sqp) < 0.0 && first(&lsqp) < 0.0);
}

// ============================================================================
// Stationary start
// ============================================================================

#[test]
fn test_stationary_start_takes_zero_step() {
    let output = solve(&scenario_a(SolverOptions::default(), 0.5, 0.5)).unwrap();

    assert_eq!(
        output.termination_status,
        TerminationStatus::Converged(ConvergenceCriterion::GradientNorm)
    );
    assert_eq!(output.number_of_iterations, 1);
    assert_eq!(output.steps, vec![0.0]);
    assert_eq!(output.magnitude_of_step, vec![0.0]);
    assert_eq!(output.design_points[0], output.design_points[1]);
    assert!((output.variable("x").unwrap().magnitude - 0.5).abs() < 1e-12);
}

/// `x^a·y^b` over `lower ≤ x, y ≤ upper` (either side optional), in SGP.
fn bounded_monomial(
    exponents: (f64, f64),
    lower: Option<f64>,
    upper: Option<f64>,
    x0: f64,
    y0: f64,
) -> Formulation {
    let mut rows: Vec<ConstraintRow> = Vec::new();
    for name in ["x", "y"] {
        if let Some(bound) = lower {
            rows.push(Constraint::ge(Signomial::variable(name), Signomial::scalar(bound)).into());
        }
        if let Some(bound) = upper {
            rows.push(Constraint::le(Signomial::variable(name), Signomial::scalar(bound)).into());
        }
    }
    Formulation::new(
        vec![Variable::dimensionless("x", x0), Variable::dimensionless("y", y0)],
        Signomial::monomial(1.0, &[("x", exponents.0), ("y", exponents.1)]),
        rows,
        SolverOptions::with_mode(SolveMode::Sgp),
    )
    .unwrap()
}

#[test]
fn test_feasible_start_with_inactive_bounds_moves() {
    // Both lower bounds are inactive at (2, 1.5) but active in the subproblem
    let output = solve(&bounded_monomial((1.0, 1.0), Some(1.0), None, 2.0, 1.5)).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    assert!(output.magnitude_of_step[0] > 0.1, "first step {:?}", output.magnitude_of_step);
    assert!(output.steps[0] > 0.0);
    assert_ne!(output.design_points[1], output.design_points[0]);
    assert!((output.variable("x").unwrap().magnitude - 1.0).abs() < 1e-4);
    assert!((output.variable("y").unwrap().magnitude - 1.0).abs() < 1e-4);
}

#[test]
fn test_monomial_objective_leaves_the_start() {
    // ln(1/(x·y)) has a constant gradient in log space
    let output = solve(&bounded_monomial((-1.0, -1.0), None, Some(2.0), 1.0, 1.5)).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    let start = &output.design_points[0];
    let last = output.design_points.last().unwrap();
    assert_eq!(start, &vec![1.0, 1.5]);
    assert!((last[0] - 2.0).abs() < 1e-4 && (last[1] - 2.0).abs() < 1e-4, "{last:?}");
    assert!(output.magnitude_of_step[0] > 0.1, "first step {:?}", output.magnitude_of_step);
    assert!((output.objective_value().unwrap() - 0.25).abs() < 1e-4);
}
