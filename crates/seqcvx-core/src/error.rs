//! Error types for model construction and evaluation.
//!
//! Three families cover everything the modeling layer can report:
//!
//! - [`DimensionError`]: shapes or units that do not line up
//! - [`EvaluationError`]: an expression or black-box model could not produce a value
//! - [`ConfigurationError`]: a formulation or option set that can never be solved
//!
//! The solver crate wraps these into its own error enum and decides which of
//! them are recoverable inside a line search.
//!
//! # Example
//!
//! ```
//! use seqcvx_core::{ConfigurationError, SolverOptions};
//!
//! let mut options = SolverOptions::default();
//! options.tau = 1.5;
//! assert!(matches!(
//!     options.validate(),
//!     Err(ConfigurationError::InvalidOption { .. })
//! ));
//! ```

use thiserror::Error;

use crate::units::Unit;

/// Shape or unit inconsistency.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DimensionError {
    /// A nested row list whose rows differ in length.
    #[error("Ragged matrix: row {row} has {found} entries, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// Two collections that should be index-aligned are not.
    #[error("Length mismatch in {context}: expected {expected}, found {found}")]
    LengthMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// Quantities combined across incompatible units.
    #[error("Unit mismatch in {context}: expected {expected}, found {found}")]
    UnitMismatch {
        context: String,
        expected: Unit,
        found: Unit,
    },
}

/// Failure to produce a finite value at a point.
#[derive(Error, Debug)]
pub enum EvaluationError {
    /// An expression evaluated to NaN or infinity (e.g. a negative base under a
    /// fractional power, or a division by zero).
    #[error("Expression `{expression}` is undefined at this point: {reason}")]
    Undefined { expression: String, reason: String },

    /// A black-box analysis model failed.
    #[error("Analysis model for `{constraint}` failed")]
    Model {
        constraint: String,
        #[source]
        source: anyhow::Error,
    },

    /// An expression referenced a variable missing from the variable space.
    #[error("Unknown variable `{0}`")]
    UnknownVariable(String),

    #[error(transparent)]
    Dimension(#[from] DimensionError),
}

/// A formulation or option set that is invalid before any iteration runs.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid option `{name}`: {reason}")]
    InvalidOption { name: String, reason: String },

    /// A runtime constraint declares a different number of operators than outputs.
    #[error("Runtime constraint `{constraint}` has {outputs} outputs but {operators} operators")]
    OperatorCountMismatch {
        constraint: String,
        outputs: usize,
        operators: usize,
    },

    #[error("Unknown variable `{name}` referenced by {context}")]
    UnknownVariable { name: String, context: String },

    #[error("Variable `{0}` is declared twice")]
    DuplicateVariable(String),

    #[error("Unit mismatch in {context}: {source}")]
    UnitMismatch {
        context: String,
        #[source]
        source: DimensionError,
    },

    /// The formulation cannot be handled by the selected mode.
    #[error("Unsupported by {mode} mode: {reason}")]
    Unsupported { mode: String, reason: String },

    #[error("Failed to parse options: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigurationError {
    /// Shorthand for an [`ConfigurationError::InvalidOption`].
    pub fn invalid_option(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`ConfigurationError::Unsupported`].
    pub fn unsupported(mode: impl ToString, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            mode: mode.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_error_display() {
        let err = DimensionError::RaggedRows {
            row: 2,
            expected: 3,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Ragged matrix: row 2 has 1 entries, expected 3"
        );
    }

    #[test]
    fn test_model_error_keeps_source() {
        let err = EvaluationError::Model {
            constraint: "drag".to_string(),
            source: anyhow::anyhow!("mesh did not converge"),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("mesh did not converge"));
    }

    #[test]
    fn test_configuration_error_shorthands() {
        let err = ConfigurationError::invalid_option("tau", "must lie in (0, 1)");
        assert!(err.to_string().contains("tau"));
        let err = ConfigurationError::unsupported("sgp", "objective is not a posynomial");
        assert_eq!(
            err.to_string(),
            "Unsupported by sgp mode: objective is not a posynomial"
        );
    }
}
