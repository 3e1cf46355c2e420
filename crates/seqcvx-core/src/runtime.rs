//! Black-box ("runtime") constraints.
//!
//! Some constraint functions have no symbolic form: they come out of an
//! external analysis (a flow solver, a structural code, a lookup table). The
//! solver sees such a function only through [`AnalysisModel::evaluate`], which
//! returns the output values and their Jacobian with respect to the declared
//! inputs.
//!
//! A [`RuntimeConstraint`] pairs a model with the relation each output must
//! satisfy:
//!
//! ```text
//! output_i(inputs)  op_i  target_i(x)
//! ```
//!
//! where `target_i` is an ordinary [`Signomial`] (often a constant).
//!
//! # Jacobian contract
//!
//! `jacobian[i][j]` is `∂output_i/∂input_j` and its unit must be
//! `unit(output_i) / unit(input_j)`. Models that cannot differentiate can be
//! wrapped in a [`FiniteDifferenceModel`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constraint::Operator;
use crate::error::{ConfigurationError, EvaluationError};
use crate::expression::Signomial;
use crate::units::{Quantity, Unit};

/// How a Jacobian row was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GradientAccuracy {
    /// Returned by the model itself.
    #[default]
    Supplied,
    /// Central differences.
    CentralDifference,
    /// One side of the central difference failed and a one-sided difference
    /// was used instead.
    OneSidedFallback,
}

impl GradientAccuracy {
    pub fn is_degraded(self) -> bool {
        matches!(self, GradientAccuracy::OneSidedFallback)
    }
}

/// Result of one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvaluation {
    pub values: Vec<Quantity>,
    /// `jacobian[i][j] = ∂values[i] / ∂inputs[j]`
    pub jacobian: Vec<Vec<Quantity>>,
    /// One entry per output; may be left empty to mean "all supplied".
    pub accuracy: Vec<GradientAccuracy>,
}

impl ModelEvaluation {
    pub fn new(values: Vec<Quantity>, jacobian: Vec<Vec<Quantity>>) -> Self {
        Self {
            values,
            jacobian,
            accuracy: Vec::new(),
        }
    }

    /// Accuracy of output `i` (defaults to [`GradientAccuracy::Supplied`]).
    pub fn accuracy_of(&self, i: usize) -> GradientAccuracy {
        self.accuracy.get(i).copied().unwrap_or_default()
    }
}

/// An external analysis that maps input quantities to outputs and Jacobian.
pub trait AnalysisModel: Send + Sync {
    fn evaluate(&self, inputs: &[Quantity]) -> anyhow::Result<ModelEvaluation>;
}

impl<F> AnalysisModel for F
where
    F: Fn(&[Quantity]) -> anyhow::Result<ModelEvaluation> + Send + Sync,
{
    fn evaluate(&self, inputs: &[Quantity]) -> anyhow::Result<ModelEvaluation> {
        self(inputs)
    }
}

type ValueFn = dyn Fn(&[f64]) -> anyhow::Result<Vec<f64>> + Send + Sync;

/// Adapts a value-only function into an [`AnalysisModel`] using finite
/// differences.
///
/// Each input is perturbed by `relative_step · max(|xⱼ|, 1)` in both
/// directions. If one of the two perturbed evaluations fails, the surviving
/// side is used together with the base value and the output is flagged
/// [`GradientAccuracy::OneSidedFallback`]. Only when both sides fail does the
/// evaluation fail.
pub struct FiniteDifferenceModel {
    function: Box<ValueFn>,
    output_units: Vec<Unit>,
    relative_step: f64,
}

impl FiniteDifferenceModel {
    pub fn new<F>(output_units: Vec<Unit>, function: F) -> Self
    where
        F: Fn(&[f64]) -> anyhow::Result<Vec<f64>> + Send + Sync + 'static,
    {
        Self {
            function: Box::new(function),
            output_units,
            relative_step: 1e-6,
        }
    }

    pub fn with_relative_step(mut self, step: f64) -> Self {
        self.relative_step = step;
        self
    }

    fn call(&self, x: &[f64]) -> anyhow::Result<Vec<f64>> {
        let values = (self.function)(x)?;
        if values.len() != self.output_units.len() {
            anyhow::bail!(
                "model returned {} values, expected {}",
                values.len(),
                self.output_units.len()
            );
        }
        if values.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("model returned a non-finite value");
        }
        Ok(values)
    }
}

impl AnalysisModel for FiniteDifferenceModel {
    fn evaluate(&self, inputs: &[Quantity]) -> anyhow::Result<ModelEvaluation> {
        let x: Vec<f64> = inputs.iter().map(|q| q.magnitude).collect();
        let base = self.call(&x)?;
        let n_out = base.len();

        let mut jacobian = vec![vec![Quantity::default(); inputs.len()]; n_out];
        let mut accuracy = vec![GradientAccuracy::CentralDifference; n_out];

        for (j, input) in inputs.iter().enumerate() {
            let h = self.relative_step * x[j].abs().max(1.0);
            let mut forward = x.clone();
            forward[j] += h;
            let mut backward = x.clone();
            backward[j] -= h;

            let (derivs, degraded): (Vec<f64>, bool) =
                match (self.call(&forward), self.call(&backward)) {
                    (Ok(f), Ok(b)) => (
                        f.iter().zip(&b).map(|(fi, bi)| (fi - bi) / (2.0 * h)).collect(),
                        false,
                    ),
                    (Ok(f), Err(_)) => (
                        f.iter().zip(&base).map(|(fi, ci)| (fi - ci) / h).collect(),
                        true,
                    ),
                    (Err(_), Ok(b)) => (
                        base.iter().zip(&b).map(|(ci, bi)| (ci - bi) / h).collect(),
                        true,
                    ),
                    (Err(e), Err(_)) => {
                        return Err(e.context(format!(
                            "finite difference failed on both sides of input {j}"
                        )))
                    }
                };

            for (i, d) in derivs.into_iter().enumerate() {
                jacobian[i][j] = Quantity::new(d, &self.output_units[i] / &input.unit);
                if degraded {
                    accuracy[i] = GradientAccuracy::OneSidedFallback;
                }
            }
        }

        let values = base
            .into_iter()
            .zip(&self.output_units)
            .map(|(v, u)| Quantity::new(v, u.clone()))
            .collect();

        Ok(ModelEvaluation {
            values,
            jacobian,
            accuracy,
        })
    }
}

/// One output of a runtime constraint and the relation it must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOutput {
    pub name: String,
    pub unit: Unit,
    /// Right-hand side of `output op target`.
    pub target: Signomial,
}

impl RuntimeOutput {
    pub fn new(name: impl Into<String>, unit: Unit, target: Signomial) -> Self {
        Self {
            name: name.into(),
            unit,
            target,
        }
    }
}

/// A constraint block evaluated by an [`AnalysisModel`].
#[derive(Clone)]
pub struct RuntimeConstraint {
    pub name: String,
    /// Input variable names, in the order the model expects.
    pub inputs: Vec<String>,
    pub outputs: Vec<RuntimeOutput>,
    /// One operator per output.
    pub operators: Vec<Operator>,
    pub model: Arc<dyn AnalysisModel>,
}

impl RuntimeConstraint {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<RuntimeOutput>,
        operators: Vec<Operator>,
        model: Arc<dyn AnalysisModel>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if operators.len() != outputs.len() {
            return Err(ConfigurationError::OperatorCountMismatch {
                constraint: name,
                outputs: outputs.len(),
                operators: operators.len(),
            });
        }
        Ok(Self {
            name,
            inputs,
            outputs,
            operators,
            model,
        })
    }

    /// Call the model, attributing failures to this constraint.
    pub fn call_model(&self, inputs: &[Quantity]) -> Result<ModelEvaluation, EvaluationError> {
        self.model
            .evaluate(inputs)
            .map_err(|source| EvaluationError::Model {
                constraint: self.name.clone(),
                source,
            })
    }
}

impl fmt::Debug for RuntimeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConstraint")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("operators", &self.operators)
            .finish_non_exhaustive()
    }
}
