//! End-to-end solves of small problems in every mode
//!
//! Tests cover:
//! - Explicit linear constraint with quadratic objective (SQP, SLCP)
//! - The same constraint supplied by a black-box model
//! - Posynomial problems through SGP, with explicit and runtime constraints
//! - Log-convex objective under a posynomial bound (SLCP)
//! - Variable and objective scaling, and unit-carrying results

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use seqcvx_algo::{solve, SequentialSolver};
use seqcvx_core::{
    AnalysisModel, Constraint, CurvatureRecord, Formulation, ModelEvaluation, Operator, Quantity,
    RuntimeConstraint, RuntimeOutput, Signomial, SolveMode, SolverOptions, Unit, Variable,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quadratic_objective() -> Signomial {
    Signomial::monomial(1.0, &[("x", 2.0)]) + Signomial::monomial(1.0, &[("y", 2.0)])
}

fn sum_xy() -> Signomial {
    Signomial::variable("x") + Signomial::variable("y")
}

fn variables(x0: f64, y0: f64) -> Vec<Variable> {
    vec![Variable::dimensionless("x", x0), Variable::dimensionless("y", y0)]
}

fn assert_close(actual: f64, expected: f64, tolerance: f64, what: &str) {
    assert!(
        (actual - expected).abs() < tolerance,
        "{what}: expected {expected}, got {actual}"
    );
}

/// `value = x + y`, `gradient = [1, 1]`
fn sum_model(calls: Arc<AtomicUsize>) -> Arc<dyn AnalysisModel> {
    Arc::new(move |x: &[Quantity]| -> anyhow::Result<ModelEvaluation> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ModelEvaluation::new(
            vec![Quantity::dimensionless(x[0].magnitude + x[1].magnitude)],
            vec![vec![Quantity::dimensionless(1.0), Quantity::dimensionless(1.0)]],
        ))
    })
}

/// `value = x·y`, `gradient = [y, x]`
fn product_model() -> Arc<dyn AnalysisModel> {
    Arc::new(|x: &[Quantity]| -> anyhow::Result<ModelEvaluation> {
        let (a, b) = (x[0].magnitude, x[1].magnitude);
        Ok(ModelEvaluation::new(
            vec![Quantity::dimensionless(a * b)],
            vec![vec![Quantity::dimensionless(b), Quantity::dimensionless(a)]],
        ))
    })
}

fn runtime_row(
    name: &str,
    model: Arc<dyn AnalysisModel>,
    operator: Operator,
    target: f64,
) -> RuntimeConstraint {
    RuntimeConstraint::new(
        name,
        vec!["x".into(), "y".into()],
        vec![RuntimeOutput::new("value", Unit::dimensionless(), Signomial::scalar(target))],
        vec![operator],
        model,
    )
    .unwrap()
}

// ============================================================================
// Quadratic objective, x + y >= 1
// ============================================================================

#[test]
fn test_explicit_linear_constraint_sqp() {
    init_tracing();
    let formulation = Formulation::new(
        variables(2.0, 2.0),
        quadratic_objective(),
        vec![Constraint::ge(sum_xy(), Signomial::scalar(1.0)).into()],
        SolverOptions::default(),
    )
    .unwrap();
    let output = solve(&formulation).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    assert_close(output.variable("x").unwrap().magnitude, 0.5, 1e-4, "x");
    assert_close(output.variable("y").unwrap().magnitude, 0.5, 1e-4, "y");
    assert_close(output.objective_value().unwrap(), 0.5, 1e-4, "objective");
    assert!(output.number_of_iterations < 20);
    assert_eq!(output.design_points.len(), output.number_of_iterations + 1);
    assert_eq!(output.steps.len(), output.number_of_iterations);
    assert!(matches!(
        output.hessian_approximations.last(),
        Some(CurvatureRecord::Lagrangian(_))
    ));
}

#[test]
fn test_runtime_linear_constraint_matches_explicit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let explicit = Formulation::new(
        variables(2.0, 2.0),
        quadratic_objective(),
        vec![Constraint::ge(sum_xy(), Signomial::scalar(1.0)).into()],
        SolverOptions::default(),
    )
    .unwrap();
    let runtime = Formulation::new(
        variables(2.0, 2.0),
        quadratic_objective(),
        vec![runtime_row("sum", sum_model(calls.clone()), Operator::GreaterEqual, 1.0).into()],
        SolverOptions::default(),
    )
    .unwrap();

    let a = solve(&explicit).unwrap();
    let b = solve(&runtime).unwrap();
    assert!(b.is_converged(), "{:?}", b.messages);
    for name in ["x", "y"] {
        assert_close(
            b.variable(name).unwrap().magnitude,
            a.variable(name).unwrap().magnitude,
            1e-5,
            name,
        );
    }
    assert_close(b.objective_value().unwrap(), 0.5, 1e-4, "objective");

    // One model call per distinct point: the start plus at most one per trial
    let trials: usize = b.steps.len() * SolverOptions::default().max_step_size_tries;
    let used = calls.load(Ordering::SeqCst);
    assert!(used >= 1 + b.number_of_iterations.min(1));
    assert!(used <= 1 + trials);
}

#[test]
fn test_explicit_linear_constraint_slcp() {
    let formulation = Formulation::new(
        variables(2.0, 2.0),
        quadratic_objective(),
        vec![Constraint::ge(sum_xy(), Signomial::scalar(1.0)).into()],
        SolverOptions::with_mode(SolveMode::Slcp),
    )
    .unwrap();
    let output = solve(&formulation).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    assert_close(output.variable("x").unwrap().magnitude, 0.5, 1e-3, "x");
    assert_close(output.variable("y").unwrap().magnitude, 0.5, 1e-3, "y");
    assert_close(output.objective_value().unwrap(), 0.5, 1e-3, "objective");
}

// ============================================================================
// Posynomial problems through SGP
// ============================================================================

fn bounded_product(objective: Signomial, x0: f64, y0: f64) -> Formulation {
    let xy = Signomial::monomial(1.0, &[("x", 1.0), ("y", 1.0)]);
    Formulation::new(
        variables(x0, y0),
        objective,
        vec![
            Constraint::ge(Signomial::variable("x"), Signomial::scalar(1.0)).into(),
            Constraint::ge(Signomial::variable("y"), Signomial::scalar(1.0)).into(),
            Constraint::le(xy, Signomial::scalar(4.0)).into(),
        ],
        SolverOptions::with_mode(SolveMode::Sgp),
    )
    .unwrap()
}

#[test]
fn test_sgp_minimizes_product_to_lower_bounds() {
    let objective = Signomial::monomial(1.0, &[("x", 1.0), ("y", 1.0)]);
    let output = solve(&bounded_product(objective, 2.0, 1.5)).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    assert_close(output.variable("x").unwrap().magnitude, 1.0, 1e-4, "x");
    assert_close(output.variable("y").unwrap().magnitude, 1.0, 1e-4, "y");
    assert_close(output.objective_value().unwrap(), 1.0, 1e-4, "objective");
}

#[test]
fn test_sgp_inverse_product_reaches_upper_boundary() {
    let objective = Signomial::monomial(1.0, &[("x", -1.0), ("y", -1.0)]);
    let output = solve(&bounded_product(objective, 2.0, 1.5)).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    let x = output.variable("x").unwrap().magnitude;
    let y = output.variable("y").unwrap().magnitude;
    assert_close(x * y, 4.0, 1e-3, "x·y");
    assert!(x >= 1.0 - 1e-4 && y >= 1.0 - 1e-4, "bounds violated at ({x}, {y})");
    assert_close(output.objective_value().unwrap(), 0.25, 1e-4, "objective");
}

#[test]
fn test_sgp_runtime_product_constraint() {
    init_tracing();
    let formulation = Formulation::new(
        variables(3.0, 3.0),
        sum_xy(),
        vec![runtime_row("area", product_model(), Operator::GreaterEqual, 4.0).into()],
        SolverOptions::with_mode(SolveMode::Sgp),
    )
    .unwrap();
    let output = solve(&formulation).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    assert_close(output.variable("x").unwrap().magnitude, 2.0, 1e-3, "x");
    assert_close(output.variable("y").unwrap().magnitude, 2.0, 1e-3, "y");
    assert_close(output.objective_value().unwrap(), 4.0, 1e-3, "objective");

    match output.hessian_approximations.last() {
        Some(CurvatureRecord::RuntimeLocal(local)) => {
            assert_eq!(local.len(), 1);
            assert_eq!(local[0].constraint, "area");
            assert_eq!(local[0].output, "value");
        }
        other => panic!("expected runtime curvature, got {other:?}"),
    }
}

// ============================================================================
// SLCP with a log-convex objective
// ============================================================================

#[test]
fn test_slcp_inverse_product_under_sum_bound() {
    let formulation = Formulation::new(
        variables(0.5, 0.8),
        Signomial::monomial(1.0, &[("x", -1.0), ("y", -1.0)]),
        vec![Constraint::le(sum_xy(), Signomial::scalar(2.0)).into()],
        SolverOptions::with_mode(SolveMode::Slcp),
    )
    .unwrap();
    let output = solve(&formulation).unwrap();

    assert!(output.is_converged(), "{}: {:?}", output.termination_status, output.messages);
    assert_close(output.variable("x").unwrap().magnitude, 1.0, 1e-3, "x");
    assert_close(output.variable("y").unwrap().magnitude, 1.0, 1e-3, "y");
    assert_close(output.objective_value().unwrap(), 1.0, 1e-3, "objective");
}

// ============================================================================
// Scaling and units
// ============================================================================

#[test]
fn test_scaled_solve_reports_physical_units() {
    let metre = Unit::base("m");
    let mut options = SolverOptions::default();
    options.scale_variables = true;
    options.scale_objective = true;

    let x = Signomial::variable("x");
    let y = Signomial::variable("y");
    let formulation = Formulation::new(
        vec![Variable::new("x", 2.0, metre.clone()), Variable::new("y", 2.0, metre.clone())],
        quadratic_objective(),
        vec![Constraint::ge(x + y, Signomial::constant(Quantity::new(1.0, metre.clone()))).into()],
        options,
    )
    .unwrap();
    let output = SequentialSolver::new(&formulation).solve().unwrap();

    assert!(output.is_converged(), "{:?}", output.messages);
    let x = output.variable("x").unwrap();
    assert_eq!(x.unit, metre);
    assert_close(x.magnitude, 0.5, 1e-3, "x");
    let objective = output.objective.as_ref().unwrap();
    assert_eq!(objective.unit, metre.powf(2.0));
    assert_close(objective.magnitude, 0.5, 1e-3, "objective");
    // History is recorded in the caller's units as well
    assert_eq!(output.design_points[0], vec![2.0, 2.0]);
    assert_close(output.objective_function_values[0], 8.0, 1e-12, "f(x₀)");
}
