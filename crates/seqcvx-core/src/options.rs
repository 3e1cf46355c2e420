//! Solver options.
//!
//! Options are plain data with serde support, so partial TOML files work:
//!
//! ```toml
//! mode = "logspace-sqp"
//! max_iterations = 50
//! scale_variables = true
//!
//! [x0]
//! span = 12.0
//! ```
//!
//! Anything not given takes the value from [`SolverOptions::default`].
//! [`SolverOptions::validate`] is the single place that rejects bad values; it
//! runs when a formulation is built, never inside the iteration loop.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Which convex subproblem the sequential loop solves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolveMode {
    /// Quadratic program in the design variables.
    #[default]
    Sqp,
    /// Quadratic program in `y = ln x`, with log-ratio constraints.
    LogspaceSqp,
    /// Geometric program with convexified signomial and runtime constraints.
    Sgp,
    /// Mixed log-convex program: affine monomial rows, log-sum-exp posynomial
    /// rows and a quadratic model of the objective.
    Slcp,
}

impl SolveMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SolveMode::Sqp => "sqp",
            SolveMode::LogspaceSqp => "logspace-sqp",
            SolveMode::Sgp => "sgp",
            SolveMode::Slcp => "slcp",
        }
    }

    /// Whether iterates live in `y = ln x`.
    pub fn is_log_space(self) -> bool {
        !matches!(self, SolveMode::Sqp)
    }
}

impl fmt::Display for SolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub mode: SolveMode,

    /// Converged when the accepted step's 2-norm falls to this value.
    pub step_magnitude_tolerance: f64,

    /// Converged when `max |∇L|` falls below this value.
    pub lagrangian_gradient_tolerance: f64,

    /// Relative objective change for convergence (SLCP only).
    pub relative_tolerance: Option<f64>,

    /// Largest constraint violation still reported as feasible.
    pub constraint_tolerance: f64,

    pub max_iterations: usize,

    /// Line-search trials (and trust-region retries) per iteration.
    pub max_step_size_tries: usize,

    /// Non-decreasing merit steps tolerated before reverting.
    pub watchdog_iterations: usize,

    /// Sufficient-decrease constant of the Wolfe-I test.
    pub eta: f64,

    /// Powell damping threshold of the BFGS update.
    pub zeta: f64,

    /// Backtracking factor, in (0, 1).
    pub tau: f64,

    /// Quadratic weight on the QP slack columns.
    pub penalty_constant: f64,

    /// Linear weight on the slacks of the log-space conic subproblems.
    pub slack_penalty: f64,

    /// SR1 skip threshold.
    pub rho: f64,

    /// Additive margin in the merit penalty-weight update.
    pub mu_margin: f64,

    /// First trust-region radius used when a subproblem fails.
    pub initial_trust_radius: f64,

    pub scale_objective: bool,
    pub scale_variables: bool,
    pub scale_constraints: bool,

    /// Starting point by variable name, in each variable's own unit.
    pub x0: Option<BTreeMap<String, f64>>,

    /// Per-iteration cap on the relative change of any variable.
    pub step_schedule: Option<Vec<f64>>,

    /// Base name of the per-iteration progress files.
    pub progress_filename: Option<PathBuf>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            mode: SolveMode::Sqp,
            step_magnitude_tolerance: 1e-6,
            lagrangian_gradient_tolerance: 1e-6,
            relative_tolerance: None,
            constraint_tolerance: 1e-5,
            max_iterations: 100,
            max_step_size_tries: 30,
            watchdog_iterations: 3,
            eta: 1e-4,
            zeta: 0.2,
            tau: 0.5,
            penalty_constant: 1e6,
            slack_penalty: 1e3,
            rho: 1e-8,
            mu_margin: 0.0,
            initial_trust_radius: 1.0,
            scale_objective: false,
            scale_variables: false,
            scale_constraints: false,
            x0: None,
            step_schedule: None,
            progress_filename: None,
        }
    }
}

impl SolverOptions {
    /// Options for a given mode, everything else default.
    pub fn with_mode(mode: SolveMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigurationError> {
        let options: Self = toml::from_str(contents)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Step cap for iteration `k`, if a schedule is configured.
    ///
    /// The last entry applies to all later iterations.
    pub fn step_cap(&self, iteration: usize) -> Option<f64> {
        let schedule = self.step_schedule.as_ref()?;
        schedule
            .get(iteration)
            .or_else(|| schedule.last())
            .copied()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        positive("step_magnitude_tolerance", self.step_magnitude_tolerance)?;
        positive("lagrangian_gradient_tolerance", self.lagrangian_gradient_tolerance)?;
        positive("constraint_tolerance", self.constraint_tolerance)?;
        positive("eta", self.eta)?;
        positive("penalty_constant", self.penalty_constant)?;
        positive("slack_penalty", self.slack_penalty)?;
        positive("rho", self.rho)?;
        positive("initial_trust_radius", self.initial_trust_radius)?;

        if let Some(rel) = self.relative_tolerance {
            positive("relative_tolerance", rel)?;
        }
        if self.max_iterations == 0 {
            return Err(ConfigurationError::invalid_option(
                "max_iterations",
                "must be at least 1",
            ));
        }
        if self.max_step_size_tries == 0 {
            return Err(ConfigurationError::invalid_option(
                "max_step_size_tries",
                "must be at least 1",
            ));
        }
        if !(self.tau > 0.0 && self.tau < 1.0) {
            return Err(ConfigurationError::invalid_option(
                "tau",
                format!("must lie in (0, 1), got {}", self.tau),
            ));
        }
        if self.eta >= 1.0 {
            return Err(ConfigurationError::invalid_option(
                "eta",
                format!("must be below 1, got {}", self.eta),
            ));
        }
        if !(self.zeta > 0.0 && self.zeta < 1.0) {
            return Err(ConfigurationError::invalid_option(
                "zeta",
                format!("must lie in (0, 1), got {}", self.zeta),
            ));
        }
        if !(self.mu_margin >= 0.0 && self.mu_margin.is_finite()) {
            return Err(ConfigurationError::invalid_option(
                "mu_margin",
                "must be a finite non-negative number",
            ));
        }
        if let Some(schedule) = &self.step_schedule {
            if schedule.is_empty() {
                return Err(ConfigurationError::invalid_option(
                    "step_schedule",
                    "must not be empty",
                ));
            }
            for cap in schedule {
                positive("step_schedule", *cap)?;
            }
        }
        if let Some(x0) = &self.x0 {
            if let Some((name, _)) = x0.iter().find(|(_, v)| !v.is_finite()) {
                return Err(ConfigurationError::invalid_option(
                    "x0",
                    format!("starting value of `{name}` is not finite"),
                ));
            }
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigurationError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::invalid_option(
            name,
            format!("must be a finite positive number, got {value}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let options = SolverOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.mode, SolveMode::Sqp);
        assert_eq!(options.watchdog_iterations, 3);
    }

    #[test]
    fn test_partial_toml() {
        let options = SolverOptions::from_toml_str(
            r#"
            mode = "logspace-sqp"
            max_iterations = 25
            step_schedule = [0.5, 0.2]

            [x0]
            x = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(options.mode, SolveMode::LogspaceSqp);
        assert_eq!(options.max_iterations, 25);
        assert_eq!(options.tau, 0.5);
        assert_eq!(options.x0.unwrap()["x"], 3.0);
        assert_eq!(options.step_schedule, Some(vec![0.5, 0.2]));
    }

    #[test]
    fn test_step_cap_repeats_last_entry() {
        let options = SolverOptions {
            step_schedule: Some(vec![0.5, 0.2]),
            ..SolverOptions::default()
        };
        assert_eq!(options.step_cap(0), Some(0.5));
        assert_eq!(options.step_cap(1), Some(0.2));
        assert_eq!(options.step_cap(9), Some(0.2));
        assert_eq!(SolverOptions::default().step_cap(0), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let options = SolverOptions {
            tau: 1.0,
            ..SolverOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigurationError::InvalidOption { ref name, .. }) if name == "tau"
        ));

        assert!(matches!(
            SolverOptions::from_toml_str("mode = \"newton\""),
            Err(ConfigurationError::Parse(_))
        ));

        assert!(matches!(
            SolverOptions::from_toml_str("max_iterations = 0"),
            Err(ConfigurationError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solver.toml");
        std::fs::write(&path, "mode = \"sgp\"\nslack_penalty = 50.0\n").unwrap();
        let options = SolverOptions::from_file(&path).unwrap();
        assert_eq!(options.mode, SolveMode::Sgp);
        assert_eq!(options.slack_penalty, 50.0);
    }
}
