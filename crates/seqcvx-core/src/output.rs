//! Result accumulator of a sequential solve.
//!
//! [`OptimizationOutput`] grows by one entry per accepted iteration and is
//! finalized exactly once. It is serializable so progress files can hold the
//! complete iterate history.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::options::SolveMode;
use crate::units::Quantity;

/// Which convergence test fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceCriterion {
    /// `max |∇L|` below tolerance at a feasible point.
    GradientNorm,
    /// Accepted step small enough.
    StepNorm,
    /// Relative objective change small enough.
    RelativeObjective,
}

/// State of the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TerminationStatus {
    #[default]
    Running,
    Converged(ConvergenceCriterion),
    MaxIterationsReached,
    /// The line search (or the trust-region retry) ran out of attempts.
    LineSearchFailed,
    Cancelled,
}

impl TerminationStatus {
    pub fn is_converged(self) -> bool {
        matches!(self, TerminationStatus::Converged(_))
    }
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationStatus::Running => write!(f, "running"),
            TerminationStatus::Converged(c) => write!(f, "converged ({c:?})"),
            TerminationStatus::MaxIterationsReached => write!(f, "maximum iterations reached"),
            TerminationStatus::LineSearchFailed => write!(f, "line search failed"),
            TerminationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Curvature information recorded for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CurvatureRecord {
    /// Quasi-Newton approximation of the Lagrangian Hessian.
    Lagrangian(Vec<Vec<f64>>),
    /// Local SR1 matrices, one per runtime output.
    RuntimeLocal(Vec<LocalCurvature>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCurvature {
    pub constraint: String,
    pub output: String,
    pub matrix: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutput {
    pub mode: SolveMode,
    pub variable_names: Vec<String>,
    /// Iterates in the caller's variable units, starting with the initial point.
    pub design_points: Vec<Vec<f64>>,
    pub objective_function_values: Vec<f64>,
    pub lagrange_multipliers: Vec<Vec<f64>>,
    pub hessian_approximations: Vec<CurvatureRecord>,
    /// Accepted step sizes (fraction of the full subproblem step).
    pub steps: Vec<f64>,
    pub magnitude_of_step: Vec<f64>,
    pub gradient_of_lagrangian: Vec<Vec<f64>>,
    pub messages: Vec<String>,
    pub termination_status: TerminationStatus,
    pub variables: BTreeMap<String, Quantity>,
    pub objective: Option<Quantity>,
    pub number_of_iterations: usize,
    pub solve_time_ms: u128,
}

impl OptimizationOutput {
    pub fn new(mode: SolveMode, variable_names: Vec<String>) -> Self {
        Self {
            mode,
            variable_names,
            design_points: Vec::new(),
            objective_function_values: Vec::new(),
            lagrange_multipliers: Vec::new(),
            hessian_approximations: Vec::new(),
            steps: Vec::new(),
            magnitude_of_step: Vec::new(),
            gradient_of_lagrangian: Vec::new(),
            messages: Vec::new(),
            termination_status: TerminationStatus::Running,
            variables: BTreeMap::new(),
            objective: None,
            number_of_iterations: 0,
            solve_time_ms: 0,
        }
    }

    /// Append a diagnostic message.
    pub fn message(&mut self, text: impl Into<String>) {
        self.messages.push(text.into());
    }

    pub fn is_converged(&self) -> bool {
        self.termination_status.is_converged()
    }

    pub fn is_finalized(&self) -> bool {
        self.termination_status != TerminationStatus::Running
    }

    /// Final value of a variable by name.
    pub fn variable(&self, name: &str) -> Option<&Quantity> {
        self.variables.get(name)
    }

    /// Final objective magnitude, if finalized.
    pub fn objective_value(&self) -> Option<f64> {
        self.objective.as_ref().map(|q| q.magnitude)
    }

    /// Messages containing `needle`.
    pub fn messages_containing<'a>(&'a self, needle: &'a str) -> impl Iterator<Item = &'a String> {
        self.messages.iter().filter(move |m| m.contains(needle))
    }
}
