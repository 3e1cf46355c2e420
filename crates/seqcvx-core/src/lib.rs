//! Data model for sequential convex optimization.
//!
//! This crate holds everything a caller builds before a solve and everything a
//! solve hands back:
//!
//! - [`units`]: unit-tagged [`Quantity`] values
//! - [`variable`]: design variables and the ordered [`VariableSpace`]
//! - [`expression`]: [`Signomial`] objectives and constraint sides
//! - [`constraint`]: explicit `lhs op rhs` relations
//! - [`runtime`]: black-box constraints backed by an [`AnalysisModel`]
//! - [`options`]: [`SolverOptions`] with TOML loading
//! - [`formulation`]: the validated [`Formulation`]
//! - [`output`]: the [`OptimizationOutput`] accumulator
//!
//! The solvers themselves live in `seqcvx-algo`.

pub mod constraint;
pub mod error;
pub mod expression;
pub mod formulation;
pub mod options;
pub mod output;
pub mod runtime;
pub mod units;
pub mod variable;

pub use constraint::{Constraint, Operator};
pub use error::{ConfigurationError, DimensionError, EvaluationError};
pub use expression::{Signomial, Term};
pub use formulation::{ConstraintRow, Formulation};
pub use options::{SolveMode, SolverOptions};
pub use output::{
    ConvergenceCriterion, CurvatureRecord, LocalCurvature, OptimizationOutput, TerminationStatus,
};
pub use runtime::{
    AnalysisModel, FiniteDifferenceModel, GradientAccuracy, ModelEvaluation, RuntimeConstraint,
    RuntimeOutput,
};
pub use units::{Quantity, Unit};
pub use variable::{Variable, VariableSpace};
