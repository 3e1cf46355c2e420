//! # seqcvx-algo: Sequential Convex Optimization
//!
//! This crate solves nonlinear design problems built in [`seqcvx_core`] by a
//! sequence of convex subproblems, each solved by a conic backend.
//!
//! ## Solve modes
//!
//! The [`SequentialSolver`] runs one outer loop for four subproblem families:
//!
//! | Mode | Iterates | Subproblem | Problem Class |
//! |------|----------|------------|---------------|
//! | [`SolveMode::Sqp`] | `x` | quadratic model, linearized rows | QP |
//! | [`SolveMode::LogspaceSqp`] | `ln x` | quadratic model, linearized log-ratio rows | QP |
//! | [`SolveMode::Sgp`] | `ln x` | exact posynomial objective, convexified rows | GP (exp cones) |
//! | [`SolveMode::Slcp`] | `ln x` | quadratic objective model, log-sum-exp rows | Conic |
//!
//! ### Architecture
//!
//! - **[`problem::WorkingProblem`]**: scaled private copy of the formulation
//! - **[`evaluation::Evaluator`]**: objective and rows in the mode's coordinates
//! - **[`bridge::RuntimeConstraintBridge`]**: black-box outputs as residuals or
//!   local models
//! - **[`subproblem::SubproblemAssembler`]**: one assembler per mode, solved
//!   through [`convex`] on clarabel
//! - **[`merit::MeritFunction`]** and **[`line_search::WatchdogLineSearch`]**:
//!   step acceptance
//! - **[`curvature`]**: damped BFGS and SR1 updates
//!
//! Progress can be written after every iteration with
//! [`checkpoint::ProgressWriter`], and a running solve can be stopped through
//! a [`CancellationToken`].
//!
//! ## Example
//!
//! ```ignore
//! use seqcvx_algo::SequentialSolver;
//! use seqcvx_core::{Constraint, Formulation, Signomial, SolverOptions, Variable};
//!
//! let objective =
//!     Signomial::monomial(1.0, &[("x", 2.0)]) + Signomial::monomial(1.0, &[("y", 2.0)]);
//! let sum = Signomial::variable("x") + Signomial::variable("y");
//! let formulation = Formulation::new(
//!     vec![Variable::dimensionless("x", 2.0), Variable::dimensionless("y", 2.0)],
//!     objective,
//!     vec![Constraint::ge(sum, Signomial::scalar(1.0)).into()],
//!     SolverOptions::default(),
//! )?;
//!
//! let output = SequentialSolver::new(&formulation).solve()?;
//! println!("{}: {:?}", output.termination_status, output.objective_value());
//! ```

pub mod bridge;
pub mod cancel;
pub mod checkpoint;
pub mod convex;
pub mod curvature;
pub mod error;
pub mod evaluation;
pub mod line_search;
pub mod linalg;
pub mod merit;
pub mod problem;
pub mod solver;
pub mod state;
pub mod subproblem;

pub use bridge::{BridgeMode, ConstraintEvaluation, RuntimeConstraintBridge, RuntimeEvaluation};
pub use cancel::CancellationToken;
pub use checkpoint::{load_progress, ProgressWriter};
pub use convex::{ConicProblem, ConicSolution, GeometricProgram, GpSolution};
pub use curvature::{damped_bfgs_update, sr1_update, UpdateOutcome};
pub use error::{SolverError, SolverResult};
pub use evaluation::{EvaluationCache, Evaluator, PointEvaluation};
pub use line_search::{
    Acceptance, LineSearchOutcome, LineSearchProblem, WatchdogLineSearch, WatchdogState,
};
pub use merit::{MeritEvaluation, MeritFunction, MeritMode, MeritRequest};
pub use problem::WorkingProblem;
pub use solver::{solve, SequentialSolver};
pub use state::{IterateSnapshot, IterateState};
pub use subproblem::{assembler_for, SubproblemAssembler, SubproblemInput, SubproblemSolution};

pub use seqcvx_core::SolveMode;
