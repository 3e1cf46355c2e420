//! The sequential convex optimization loop.
//!
//! ```text
//! Initializing ─► Iterating ─┬─► Converged(GradientNorm | StepNorm | RelativeObjective)
//!                    ▲       ├─► MaxIterationsReached
//!                    │       ├─► LineSearchFailed
//!                    │       └─► Cancelled
//!                    └── curvature update
//! ```
//!
//! One iteration:
//!
//! 1. build and solve the convex subproblem of the mode at the current point,
//!    retrying under a shrinking trust region when the backend rejects it
//! 2. stop with zero step if the subproblem multipliers already make the
//!    current point stationary and feasible
//! 3. watchdog line search on the ℓ₁ merit function, then the step-schedule cap
//! 4. termination tests at the accepted point
//! 5. damped BFGS on the Lagrangian (SR1 on runtime outputs for SGP)
//!
//! Only failures at the current, unperturbed iterate are returned as errors.
//! Everything recoverable ends up in [`OptimizationOutput::messages`] and, if
//! it stops the loop, in the termination status.

use seqcvx_core::{
    ConvergenceCriterion, CurvatureRecord, Formulation, LocalCurvature, OptimizationOutput,
    Quantity, SolveMode, SolverOptions, TerminationStatus,
};
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::cancel::CancellationToken;
use crate::checkpoint::ProgressWriter;
use crate::curvature::{damped_bfgs_update, sr1_update, UpdateOutcome};
use crate::error::{SolverError, SolverResult};
use crate::evaluation::{
    complementarity_error, lagrangian_gradient, Coordinates, EvaluationCache, Evaluator,
    PointEvaluation,
};
use crate::line_search::{Acceptance, LineSearchProblem, WatchdogLineSearch};
use crate::linalg::{axpy, norm_2, norm_inf, sub};
use crate::merit::{MeritEvaluation, MeritFunction, MeritMode, MeritRequest};
use crate::problem::{RowSource, WorkingProblem};
use crate::state::{IterateSnapshot, IterateState};
use crate::subproblem::{
    assembler_for, SubproblemAssembler, SubproblemInput, SubproblemSolution,
};

/// Solve a formulation with default cancellation.
pub fn solve(formulation: &Formulation) -> SolverResult<OptimizationOutput> {
    SequentialSolver::new(formulation).solve()
}

pub struct SequentialSolver<'f> {
    formulation: &'f Formulation,
    cancel: CancellationToken,
}

impl<'f> SequentialSolver<'f> {
    pub fn new(formulation: &'f Formulation) -> Self {
        Self {
            formulation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this solver from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn solve(&self) -> SolverResult<OptimizationOutput> {
        let problem = WorkingProblem::build(self.formulation)?;
        Run::new(&problem, &self.cancel).execute()
    }
}

#[derive(Debug, Clone)]
struct BestIterate {
    w: Vec<f64>,
    violation: f64,
    violations: Vec<f64>,
    objective: f64,
}

impl BestIterate {
    fn improves_on(&self, other: &BestIterate, tolerance: f64) -> bool {
        if self.violation <= tolerance && other.violation <= tolerance {
            self.objective < other.objective
        } else {
            self.violation < other.violation
        }
    }
}

/// Mutable bookkeeping of one solve.
struct Run<'a> {
    problem: &'a WorkingProblem,
    cancel: &'a CancellationToken,
    evaluator: Evaluator<'a>,
    merit: MeritFunction<'a>,
    assembler: Box<dyn SubproblemAssembler>,
    writer: Option<ProgressWriter>,
    output: OptimizationOutput,
    best: Option<BestIterate>,
    last_slacks: Vec<f64>,
    small_steps: usize,
    started: Instant,
}

impl<'a> Run<'a> {
    fn new(problem: &'a WorkingProblem, cancel: &'a CancellationToken) -> Self {
        let evaluator = Evaluator::new(problem, cancel);
        Self {
            problem,
            cancel,
            evaluator,
            merit: MeritFunction::new(evaluator, problem.options.mu_margin),
            assembler: assembler_for(problem.mode),
            writer: problem.options.progress_filename.clone().map(ProgressWriter::new),
            output: OptimizationOutput::new(problem.mode, problem.variable_names()),
            best: None,
            last_slacks: Vec::new(),
            small_steps: 0,
            started: Instant::now(),
        }
    }

    fn execute(mut self) -> SolverResult<OptimizationOutput> {
        let problem = self.problem;
        let options = &problem.options;
        info!(
            mode = %problem.mode,
            variables = problem.len(),
            rows = problem.row_count(),
            "starting sequential solve"
        );

        let mut state = IterateState::initial(problem);
        let v0 = self.evaluator.point_of(&state.w);
        let f0 = problem.objective_value(&v0)?;
        self.output.design_points.push(problem.to_physical(&v0));
        self.output.objective_function_values.push(f0);

        let mut current = match self.evaluator.evaluate_point(&state.w, &mut state.cache) {
            Ok(evaluation) => evaluation,
            Err(SolverError::Cancelled) => {
                self.output.message("solve cancelled before the first evaluation");
                return self.finish(TerminationStatus::Cancelled, &state, None);
            }
            Err(e) => return Err(e),
        };
        self.track_best(&state.w, &current, f0);

        let mut watchdog = WatchdogLineSearch::new(
            options.eta,
            options.tau,
            options.max_step_size_tries,
            options.watchdog_iterations,
        );
        let mut status = TerminationStatus::MaxIterationsReached;
        for k in 1..=options.max_iterations {
            if self.cancel.is_cancelled() {
                status = TerminationStatus::Cancelled;
                self.output
                    .message(format!("solve cancelled after {} iterations", k - 1));
                break;
            }
            match self.iterate(k, &mut state, &mut current, &mut watchdog) {
                Ok(Some(done)) => {
                    status = done;
                    break;
                }
                Ok(None) => {}
                Err(SolverError::Cancelled) => {
                    status = TerminationStatus::Cancelled;
                    self.output.message(format!("solve cancelled during iteration {k}"));
                    break;
                }
                Err(e @ SolverError::LineSearchExhausted { .. }) => {
                    warn!(iteration = k, error = %e, "no acceptable step");
                    self.output.message(format!("iteration {k}: {e}"));
                    status = TerminationStatus::LineSearchFailed;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if status == TerminationStatus::MaxIterationsReached {
            let message = format!(
                "maximum number of iterations ({}) reached without convergence",
                options.max_iterations
            );
            warn!("{message}");
            self.output.message(message);
        }
        self.finish(status, &state, Some(&current))
    }

    fn iterate(
        &mut self,
        k: usize,
        state: &mut IterateState,
        current: &mut PointEvaluation,
        watchdog: &mut WatchdogLineSearch<IterateSnapshot>,
    ) -> SolverResult<Option<TerminationStatus>> {
        let problem = self.problem;
        let options = &problem.options;
        let v = self.evaluator.point_of(&state.w);
        state.cache.ensure_point(&v);

        let mut solution = self.solve_subproblem(k, state, current, &v)?;

        // Already a KKT point: accept a zero step.
        let stationarity =
            lagrangian_gradient(&current.objective.gradient, &current.rows, &solution.multipliers);
        if satisfies_kkt(options, &stationarity, current, &solution.multipliers) {
            let objective = problem.objective_value(&v)?;
            state.multipliers = solution.multipliers.clone();
            self.last_slacks = solution.slacks;
            let record = self.curvature_record(state);
            self.record(k, &v, objective, &state.multipliers, 0.0, 0.0, stationarity, record);
            info!(iteration = k, "stationary at the current point");
            self.write_progress(k);
            return Ok(Some(TerminationStatus::Converged(
                ConvergenceCriterion::GradientNorm,
            )));
        }

        // ------------------------------------------------------------------
        // Watchdog line search
        // ------------------------------------------------------------------
        let mut context = IterationContext {
            merit: &self.merit,
            state: &mut *state,
            solution: &mut solution,
            current: &mut *current,
            trial_cache: EvaluationCache::new(problem.runtime.len()),
            iteration: k,
            messages: Vec::new(),
        };
        let searched = watchdog.search(&mut context);
        let IterationContext {
            trial_cache,
            messages,
            ..
        } = context;
        for message in messages {
            self.output.message(message);
        }
        let outcome = searched?;

        // The search may have restored an earlier iterate.
        let v_old = self.evaluator.point_of(&state.w);
        let direction = solution.direction.clone();
        let mut alpha = outcome.step_size;
        let mut accepted = outcome.merit.evaluation;

        if let Some(cap) = options.step_cap(k - 1) {
            let limit = step_limit(problem.convention.coordinates, &v_old, &direction, cap);
            if alpha > limit {
                self.output.message(format!(
                    "iteration {k}: step size {alpha:.3e} capped at {limit:.3e} by step schedule"
                ));
                alpha = limit;
                accepted = None;
            }
        }
        let (w_new, evaluation, cache) = match accepted {
            Some(evaluation) => (axpy(&state.w, alpha, &direction), evaluation, trial_cache),
            None => self.evaluate_capped(k, &state.w, &direction, &mut alpha)?,
        };

        let s = sub(&w_new, &state.w);
        let step_norm = norm_2(&s);
        let v_new = self.evaluator.point_of(&w_new);
        let f_old = problem.objective_value(&v_old)?;
        let f_new = problem.objective_value(&v_new)?;
        let lambda = solution.multipliers.clone();
        let grad_new =
            lagrangian_gradient(&evaluation.objective.gradient, &evaluation.rows, &lambda);
        let grad_old = lagrangian_gradient(&current.objective.gradient, &current.rows, &lambda);
        let violation = evaluation.max_violation();

        // ------------------------------------------------------------------
        // Termination
        // ------------------------------------------------------------------
        if step_norm <= options.step_magnitude_tolerance {
            self.small_steps += 1;
        } else {
            self.small_steps = 0;
        }
        let mut status = None;
        let confirmed_small_steps = if problem.mode == SolveMode::Slcp { 2 } else { 1 };
        if satisfies_kkt(options, &grad_new, &evaluation, &lambda) {
            status = Some(ConvergenceCriterion::GradientNorm);
        } else if self.small_steps >= confirmed_small_steps {
            status = Some(ConvergenceCriterion::StepNorm);
        } else if problem.mode == SolveMode::Slcp {
            if let Some(tolerance) = options.relative_tolerance {
                if f_new != 0.0 && ((f_new - f_old) / f_new).abs() < tolerance {
                    status = Some(ConvergenceCriterion::RelativeObjective);
                }
            }
        }

        // ------------------------------------------------------------------
        // Curvature
        // ------------------------------------------------------------------
        if status.is_none() {
            if problem.mode == SolveMode::Sgp {
                self.update_local_curvature(state, &v_old, &v_new, &cache);
            } else {
                let y = sub(&grad_new, &grad_old);
                let (next, updated) = damped_bfgs_update(&state.curvature, &s, &y, options.zeta);
                if updated == UpdateOutcome::Skipped {
                    debug!(iteration = k, "BFGS update skipped");
                }
                state.curvature = next;
            }
        }

        for (c, o, accuracy) in cache.degraded_outputs() {
            let rc = &problem.runtime[c];
            self.output.message(format!(
                "iteration {k}: gradient of `{}.{}` has reduced accuracy ({accuracy:?})",
                rc.name, rc.outputs[o].name
            ));
        }

        state.w = w_new;
        state.multipliers = lambda;
        state.cache = cache;
        *current = evaluation;
        self.last_slacks = solution.slacks;

        let record = self.curvature_record(state);
        let multipliers = state.multipliers.clone();
        self.record(k, &v_new, f_new, &multipliers, alpha, step_norm, grad_new.clone(), record);
        self.track_best(&state.w, current, f_new);

        info!(
            iteration = k,
            objective = f_new,
            step_size = alpha,
            step_norm,
            lagrangian_gradient = norm_inf(&grad_new),
            violation,
            tentative = outcome.acceptance == Acceptance::Tentative,
            "accepted step"
        );
        self.write_progress(k);

        Ok(status.map(TerminationStatus::Converged))
    }

    /// Solve the subproblem, shrinking a trust region while the backend fails.
    fn solve_subproblem(
        &mut self,
        k: usize,
        state: &IterateState,
        current: &PointEvaluation,
        v: &[f64],
    ) -> SolverResult<SubproblemSolution> {
        let problem = self.problem;
        let options = &problem.options;
        let mut radius = None;
        let mut next_radius = options.initial_trust_radius;
        for _ in 0..=options.max_step_size_tries {
            let input = SubproblemInput {
                problem,
                w: &state.w,
                v,
                evaluation: current,
                curvature: &state.curvature,
                local_curvature: &state.local_curvature,
                cache: &state.cache,
                trust_radius: radius,
            };
            match self.assembler.solve(&input) {
                Ok(solution) => return Ok(solution),
                Err(e) if e.is_recoverable() => {
                    let message = format!(
                        "iteration {k}: subproblem failed ({e}); trust radius now {next_radius:.3e}"
                    );
                    warn!("{message}");
                    self.output.message(message);
                    radius = Some(next_radius);
                    next_radius *= options.tau;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SolverError::LineSearchExhausted {
            tries: options.max_step_size_tries,
        })
    }

    /// Evaluate at a capped step, shrinking further if the point is undefined.
    fn evaluate_capped(
        &mut self,
        k: usize,
        w: &[f64],
        direction: &[f64],
        alpha: &mut f64,
    ) -> SolverResult<(Vec<f64>, PointEvaluation, EvaluationCache)> {
        let problem = self.problem;
        let options = &problem.options;
        for _ in 0..options.max_step_size_tries {
            let point = axpy(w, *alpha, direction);
            let mut cache = EvaluationCache::new(problem.runtime.len());
            match self.evaluator.evaluate_point(&point, &mut cache) {
                Ok(evaluation) => return Ok((point, evaluation, cache)),
                Err(e) if e.is_recoverable() => {
                    self.output.message(format!(
                        "iteration {k}: capped step size {:.3e} rejected ({e}); shrinking",
                        *alpha
                    ));
                    *alpha *= options.tau;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SolverError::LineSearchExhausted {
            tries: options.max_step_size_tries,
        })
    }

    /// SR1 on every runtime output, in working variables.
    fn update_local_curvature(
        &self,
        state: &mut IterateState,
        v_old: &[f64],
        v_new: &[f64],
        cache: &EvaluationCache,
    ) {
        let s = sub(v_new, v_old);
        for (i, row) in self.problem.rows.iter().enumerate() {
            let RowSource::Runtime { constraint, output } = row.source else {
                continue;
            };
            let (Some(old), Some(new)) = (state.cache.get(constraint), cache.get(constraint)) else {
                continue;
            };
            let Some(b) = state.local_curvature.get_mut(i).and_then(Option::as_mut) else {
                continue;
            };
            let g_old: Vec<f64> = old.jacobian[output].iter().map(|q| q.magnitude).collect();
            let g_new: Vec<f64> = new.jacobian[output].iter().map(|q| q.magnitude).collect();
            let (next, updated) = sr1_update(b, &s, &sub(&g_new, &g_old), self.problem.options.rho);
            if updated == UpdateOutcome::Skipped {
                debug!(row = %row.label, "SR1 update skipped");
            }
            *b = next;
        }
    }

    fn curvature_record(&self, state: &IterateState) -> CurvatureRecord {
        if self.problem.mode != SolveMode::Sgp {
            return CurvatureRecord::Lagrangian(state.curvature.clone());
        }
        let mut local = Vec::new();
        for (row, matrix) in self.problem.rows.iter().zip(&state.local_curvature) {
            if let (RowSource::Runtime { constraint, output }, Some(matrix)) =
                (&row.source, matrix)
            {
                let rc = &self.problem.runtime[*constraint];
                local.push(LocalCurvature {
                    constraint: rc.name.clone(),
                    output: rc.outputs[*output].name.clone(),
                    matrix: matrix.clone(),
                });
            }
        }
        CurvatureRecord::RuntimeLocal(local)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        k: usize,
        v: &[f64],
        objective: f64,
        multipliers: &[f64],
        step_size: f64,
        step_norm: f64,
        lagrangian_gradient: Vec<f64>,
        curvature: CurvatureRecord,
    ) {
        let out = &mut self.output;
        out.design_points.push(self.problem.to_physical(v));
        out.objective_function_values.push(objective);
        out.lagrange_multipliers.push(multipliers.to_vec());
        out.steps.push(step_size);
        out.magnitude_of_step.push(step_norm);
        out.gradient_of_lagrangian.push(lagrangian_gradient);
        out.hessian_approximations.push(curvature);
        out.number_of_iterations = k;
    }

    fn track_best(&mut self, w: &[f64], evaluation: &PointEvaluation, objective: f64) {
        let candidate = BestIterate {
            w: w.to_vec(),
            violation: evaluation.max_violation(),
            violations: evaluation.violations(),
            objective,
        };
        let tolerance = self.problem.options.constraint_tolerance;
        let replace = match &self.best {
            Some(best) => candidate.improves_on(best, tolerance),
            None => true,
        };
        if replace {
            self.best = Some(candidate);
        }
    }

    fn write_progress(&mut self, k: usize) {
        let Some(writer) = &self.writer else {
            return;
        };
        if let Err(e) = writer.write(k, &self.output) {
            warn!(iteration = k, error = %e, "could not write progress file");
            let message = format!("iteration {k}: could not write progress file: {e}");
            self.output.message(message);
        }
    }

    fn finish(
        mut self,
        status: TerminationStatus,
        state: &IterateState,
        current: Option<&PointEvaluation>,
    ) -> SolverResult<OptimizationOutput> {
        let problem = self.problem;
        let tolerance = problem.options.constraint_tolerance;

        let (w, violations) = match (status.is_converged(), self.best.take()) {
            (false, Some(best)) => {
                if best.w != state.w {
                    self.output.message(format!(
                        "returning the best iterate found (objective {:.6e}, max violation {:.3e})",
                        best.objective, best.violation
                    ));
                }
                (best.w, best.violations)
            }
            _ => (
                state.w.clone(),
                current.map(PointEvaluation::violations).unwrap_or_default(),
            ),
        };

        let v = self.evaluator.point_of(&w);
        let physical = problem.to_physical(&v);
        for (j, variable) in problem.original.iter().enumerate() {
            self.output
                .variables
                .insert(variable.name.clone(), problem.original.quantity(j, physical[j]));
        }
        self.output.objective = Some(Quantity::new(
            problem.objective_value(&v)?,
            problem.objective_unit.clone(),
        ));

        for (row, violation) in problem.rows.iter().zip(&violations) {
            if *violation > tolerance {
                let message = format!(
                    "constraint `{}` is violated by {violation:.3e} (tolerance {tolerance:.1e})",
                    row.label
                );
                warn!("{message}");
                self.output.message(message);
            }
        }
        for (row, slack) in problem.rows.iter().zip(&self.last_slacks) {
            if *slack > tolerance {
                let message = format!(
                    "constraint `{}` needed a slack of {slack:.3e} in the last subproblem",
                    row.label
                );
                warn!("{message}");
                self.output.message(message);
            }
        }

        self.output.termination_status = status;
        self.output.solve_time_ms = self.started.elapsed().as_millis();
        info!(
            status = %status,
            iterations = self.output.number_of_iterations,
            objective = ?self.output.objective_value(),
            elapsed_ms = self.output.solve_time_ms,
            "sequential solve finished"
        );
        Ok(self.output)
    }
}

/// Line-search view of one iteration.
struct IterationContext<'s, 'a> {
    merit: &'s MeritFunction<'a>,
    state: &'s mut IterateState,
    solution: &'s mut SubproblemSolution,
    current: &'s mut PointEvaluation,
    trial_cache: EvaluationCache,
    iteration: usize,
    messages: Vec<String>,
}

impl LineSearchProblem for IterationContext<'_, '_> {
    type Checkpoint = IterateSnapshot;

    fn anchor(&mut self) -> SolverResult<MeritEvaluation> {
        let request = MeritRequest {
            step_size: 0.0,
            direction: &self.solution.direction,
            point: &self.state.w,
            objective_gradient: &self.current.objective.gradient,
            multipliers: &self.solution.multipliers,
        };
        self.merit.evaluate(
            &request,
            MeritMode::Anchor,
            &mut self.state.penalties,
            &mut self.state.cache,
        )
    }

    fn trial(&mut self, step: f64) -> SolverResult<MeritEvaluation> {
        let request = MeritRequest {
            step_size: step,
            direction: &self.solution.direction,
            point: &self.state.w,
            objective_gradient: &self.current.objective.gradient,
            multipliers: &self.solution.multipliers,
        };
        self.merit.evaluate(
            &request,
            MeritMode::Trial,
            &mut self.state.penalties,
            &mut self.trial_cache,
        )
    }

    fn checkpoint(&self) -> IterateSnapshot {
        IterateSnapshot {
            state: self.state.clone(),
            solution: self.solution.clone(),
            current: self.current.clone(),
        }
    }

    fn restore(&mut self, checkpoint: IterateSnapshot) {
        *self.state = checkpoint.state;
        *self.solution = checkpoint.solution;
        *self.current = checkpoint.current;
    }

    fn log(&mut self, message: String) {
        info!(iteration = self.iteration, "{message}");
        self.messages
            .push(format!("iteration {}: {message}", self.iteration));
    }
}

/// First-order optimality at `evaluation` with `multipliers`: stationary,
/// feasible and complementary, with nonnegative inequality multipliers.
fn satisfies_kkt(
    options: &SolverOptions,
    stationarity: &[f64],
    evaluation: &PointEvaluation,
    multipliers: &[f64],
) -> bool {
    norm_inf(stationarity) < options.lagrangian_gradient_tolerance
        && evaluation.max_violation() <= options.constraint_tolerance
        && complementarity_error(&evaluation.rows, multipliers) <= options.constraint_tolerance
}

/// Largest step size keeping every variable within `cap` relative change.
fn step_limit(coordinates: Coordinates, v: &[f64], direction: &[f64], cap: f64) -> f64 {
    let mut limit = f64::INFINITY;
    for (vj, dj) in v.iter().zip(direction) {
        if *dj == 0.0 {
            continue;
        }
        let allowed = match coordinates {
            Coordinates::Linear if *vj == 0.0 => continue,
            Coordinates::Linear => cap * vj.abs() / dj.abs(),
            Coordinates::Log => (1.0 + cap).ln() / dj.abs(),
        };
        limit = limit.min(allowed);
    }
    limit
}
