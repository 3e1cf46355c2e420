//! The solver's private working copy of a [`Formulation`].
//!
//! Building a [`WorkingProblem`] does everything that happens once per solve:
//!
//! 1. optional variable scaling `xⱼ = gⱼ · vⱼ` with `gⱼ` the starting value,
//!    after which the working variables `vⱼ` are dimensionless and start at 1
//! 2. optional objective normalization by `|f(x₀)|`
//! 3. flattening of the ordered constraint list into scalar rows, one per
//!    explicit constraint and one per runtime output, each tagged
//!    [`RowKind::Equality`] or [`RowKind::Inequality`]
//! 4. the checks a solve mode needs before it can start (positive starting
//!    point for the log-space modes, posynomial objective for SGP)
//!
//! The caller's formulation is never touched; every transform produces new
//! values.

use std::collections::BTreeMap;

use seqcvx_core::{
    ConfigurationError, Constraint, ConstraintRow, Formulation, Operator, Quantity,
    RuntimeConstraint, Signomial, SolveMode, SolverOptions, Unit, Variable, VariableSpace,
};

use crate::bridge::RuntimeConstraintBridge;
use crate::error::SolverResult;
use crate::evaluation::{Convention, Coordinates, ObjectiveForm, ResidualForm};
use crate::linalg::SymbolicTensor;

/// How a row enters the subproblem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Equality,
    Inequality,
}

impl From<Operator> for RowKind {
    fn from(op: Operator) -> Self {
        if op.is_equality() {
            RowKind::Equality
        } else {
            RowKind::Inequality
        }
    }
}

/// An explicit constraint in working variables, with everything the
/// residuals and the convexification need precomputed.
#[derive(Debug, Clone)]
pub struct ExplicitRow {
    pub constraint: Constraint,
    /// `lhs − rhs`
    pub difference: Signomial,
    pub difference_gradient: SymbolicTensor,
    /// Positive part `P` of `lhs − rhs = P − N`.
    pub positive: Signomial,
    pub positive_gradient: SymbolicTensor,
    /// Negative part `N` of `lhs − rhs = P − N`.
    pub negative: Signomial,
    pub negative_gradient: SymbolicTensor,
}

#[derive(Debug, Clone)]
pub enum RowSource {
    Explicit(Box<ExplicitRow>),
    /// Output `output` of runtime constraint `constraint`.
    Runtime { constraint: usize, output: usize },
}

/// One scalar constraint row.
#[derive(Debug, Clone)]
pub struct RowSpec {
    pub label: String,
    pub operator: Operator,
    pub kind: RowKind,
    /// Divisor of the difference residual (1 unless constraints are scaled).
    pub scale: f64,
    pub source: RowSource,
}

#[derive(Debug, Clone)]
pub struct WorkingProblem {
    pub mode: SolveMode,
    pub convention: Convention,
    pub options: SolverOptions,
    /// The caller's variables, for reporting.
    pub original: VariableSpace,
    /// The variables the solver iterates on.
    pub space: VariableSpace,
    /// `xⱼ = factors[j] · vⱼ`
    pub factors: Vec<Quantity>,
    pub objective: Signomial,
    pub objective_gradient: SymbolicTensor,
    pub objective_scale: f64,
    pub objective_unit: Unit,
    pub runtime: Vec<RuntimeConstraint>,
    pub rows: Vec<RowSpec>,
    /// Starting point in working variables.
    pub start: Vec<f64>,
}

impl WorkingProblem {
    pub fn build(formulation: &Formulation) -> SolverResult<Self> {
        let options = formulation.options().clone();
        let mode = options.mode;
        let original = formulation.variables().clone();
        let start = formulation.starting_point();

        // ------------------------------------------------------------------
        // Variable scaling
        // ------------------------------------------------------------------
        let (space, factors, start) = if options.scale_variables {
            let mut working = Vec::with_capacity(original.len());
            let mut factors = Vec::with_capacity(original.len());
            let mut scaled_start = Vec::with_capacity(original.len());
            for (variable, &x0) in original.iter().zip(&start) {
                let g = if x0 != 0.0 && x0.is_finite() { x0 } else { 1.0 };
                working.push(Variable::dimensionless(variable.name.clone(), x0 / g));
                factors.push(Quantity::new(g, variable.unit.clone()));
                scaled_start.push(x0 / g);
            }
            (VariableSpace::new(working)?, factors, scaled_start)
        } else {
            let factors = original
                .iter()
                .map(|_| Quantity::dimensionless(1.0))
                .collect();
            (original.clone(), factors, start)
        };

        let substitution: BTreeMap<String, Quantity> = if options.scale_variables {
            original
                .iter()
                .zip(&factors)
                .map(|(v, g)| (v.name.clone(), g.clone()))
                .collect()
        } else {
            BTreeMap::new()
        };
        let rescale = |expr: &Signomial| {
            if substitution.is_empty() {
                expr.clone()
            } else {
                expr.rescaled(&substitution)
            }
        };

        // ------------------------------------------------------------------
        // Objective
        // ------------------------------------------------------------------
        let objective_unit = formulation.objective_unit();
        let mut objective = rescale(formulation.objective());
        let mut objective_scale = 1.0;
        if options.scale_objective {
            let f0 = objective.evaluate(&space, &start)?.abs();
            if f0 > 0.0 && f0.is_finite() {
                objective_scale = f0;
                objective = objective * (1.0 / f0);
            }
        }
        let objective_gradient = SymbolicTensor::from_gradient(objective.gradient(&space));

        // ------------------------------------------------------------------
        // Rows
        // ------------------------------------------------------------------
        let mut runtime = Vec::new();
        let mut rows = Vec::new();
        for entry in formulation.constraints() {
            match entry {
                ConstraintRow::Explicit(c) => {
                    let constraint = Constraint {
                        lhs: rescale(&c.lhs),
                        operator: c.operator,
                        rhs: rescale(&c.rhs),
                        label: c.label.clone(),
                    };
                    let scale = if options.scale_constraints {
                        let lhs = constraint.lhs.evaluate(&space, &start)?.abs();
                        let rhs = constraint.rhs.evaluate(&space, &start)?.abs();
                        positive_or_one(lhs.max(rhs))
                    } else {
                        1.0
                    };
                    let difference = &constraint.lhs - &constraint.rhs;
                    let (positive, negative) = difference.split_signs();
                    rows.push(RowSpec {
                        label: c.display_name(),
                        operator: c.operator,
                        kind: c.operator.into(),
                        scale,
                        source: RowSource::Explicit(Box::new(ExplicitRow {
                            difference_gradient: SymbolicTensor::from_gradient(
                                difference.gradient(&space),
                            ),
                            positive_gradient: SymbolicTensor::from_gradient(
                                positive.gradient(&space),
                            ),
                            negative_gradient: SymbolicTensor::from_gradient(
                                negative.gradient(&space),
                            ),
                            constraint,
                            difference,
                            positive,
                            negative,
                        })),
                    });
                }
                ConstraintRow::Runtime(rc) => {
                    let mut working = rc.clone();
                    for output in &mut working.outputs {
                        output.target = rescale(&output.target);
                    }
                    let index = runtime.len();
                    for (k, output) in working.outputs.iter().enumerate() {
                        let scale = if options.scale_constraints {
                            positive_or_one(output.target.evaluate(&space, &start)?.abs())
                        } else {
                            1.0
                        };
                        let operator = working.operators[k];
                        rows.push(RowSpec {
                            label: format!("{}.{}", working.name, output.name),
                            operator,
                            kind: operator.into(),
                            scale,
                            source: RowSource::Runtime {
                                constraint: index,
                                output: k,
                            },
                        });
                    }
                    runtime.push(working);
                }
            }
        }

        let problem = Self {
            mode,
            convention: Convention::for_mode(mode),
            options,
            original,
            space,
            factors,
            objective,
            objective_gradient,
            objective_scale,
            objective_unit,
            runtime,
            rows,
            start,
        };
        problem.check_mode()?;
        Ok(problem)
    }

    fn check_mode(&self) -> Result<(), ConfigurationError> {
        let mode = self.mode;
        if self.convention.coordinates == Coordinates::Log {
            if let Some((variable, x0)) = self
                .space
                .iter()
                .zip(&self.start)
                .find(|(_, x0)| !(**x0 > 0.0))
            {
                return Err(ConfigurationError::unsupported(
                    mode,
                    format!(
                        "variable `{}` starts at {x0}; log-space iterates need a positive start",
                        variable.name
                    ),
                ));
            }
        }

        if self.convention.residual == ResidualForm::LogRatio {
            for row in &self.rows {
                if let RowSource::Explicit(explicit) = &row.source {
                    if explicit.positive.is_zero() || explicit.negative.is_zero() {
                        return Err(ConfigurationError::unsupported(
                            mode,
                            format!(
                                "constraint `{}` has an empty all-positive side, so no ratio form",
                                row.label
                            ),
                        ));
                    }
                }
            }
        }

        if self.convention.objective == ObjectiveForm::Log {
            let f0 = self
                .objective
                .evaluate(&self.space, &self.start)
                .map_err(|e| ConfigurationError::unsupported(mode, e.to_string()))?;
            if !(f0 > 0.0) {
                return Err(ConfigurationError::unsupported(
                    mode,
                    format!("the objective must be positive at the start, got {f0}"),
                ));
            }
        }

        if mode == SolveMode::Sgp && !self.objective.is_posynomial() {
            return Err(ConfigurationError::unsupported(
                mode,
                format!("the objective `{}` is not a posynomial", self.objective),
            ));
        }
        Ok(())
    }

    /// Number of working variables.
    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn bridge(&self) -> RuntimeConstraintBridge<'_> {
        RuntimeConstraintBridge::with_factors(&self.space, &self.factors)
    }

    /// Starting iterate in solver coordinates.
    pub fn initial_coordinates(&self) -> Vec<f64> {
        self.convention.coordinates.from_point(&self.start)
    }

    /// Working point `v` in the caller's units.
    pub fn to_physical(&self, v: &[f64]) -> Vec<f64> {
        v.iter()
            .zip(&self.factors)
            .map(|(v, g)| v * g.magnitude)
            .collect()
    }

    /// Objective in the caller's units, undoing normalization.
    pub fn objective_value(&self, v: &[f64]) -> SolverResult<f64> {
        Ok(self.objective.evaluate(&self.space, v)? * self.objective_scale)
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.original.names()
    }
}

fn positive_or_one(value: f64) -> f64 {
    if value > 0.0 && value.is_finite() {
        value
    } else {
        1.0
    }
}
