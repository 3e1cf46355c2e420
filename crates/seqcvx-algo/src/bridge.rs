//! Uniform call contract for runtime (black-box) constraints.
//!
//! The bridge is the only code that talks to an [`AnalysisModel`]. It turns a
//! point in the solver's variable space into model inputs, validates what the
//! model returns, and reshapes the answer for whichever consumer asked:
//!
//! | [`BridgeMode`] | returns |
//! |----------------|---------|
//! | `Raw` | values and Jacobian rows scattered into the global variable order |
//! | `Sqp` | residual `output − target` (`target − output` for `>=`), feasible when `≤ 0` |
//! | `LogRatio` | ratio `output/target` (or `target/output` for `>=`), feasible when `≤ 1` |
//! | `LocalAffine` | first-order Taylor expansion as an explicit [`Constraint`] |
//! | `LocalMonomial` | best local monomial fit as an explicit [`Constraint`] |
//!
//! # Scatter
//!
//! A model only differentiates with respect to its own inputs. Every other
//! global variable receives an exact zero whose unit is
//! `unit(output) / unit(variable)`, so matrices assembled from the scattered
//! rows always have one column per global variable.
//!
//! # Scaling
//!
//! When the solver works in scaled variables `xⱼ = gⱼ·vⱼ`, the bridge is built
//! with the factors `gⱼ`: model inputs are formed in the caller's units and
//! Jacobian columns are multiplied by `gⱼ`, so everything returned is with
//! respect to the working variables `v`.
//!
//! [`AnalysisModel`]: seqcvx_core::AnalysisModel

use std::collections::BTreeMap;

use seqcvx_core::{
    Constraint, DimensionError, EvaluationError, GradientAccuracy, Operator, Quantity,
    RuntimeConstraint, Signomial, Term, Unit, VariableSpace,
};

use crate::error::SolverResult;
use crate::linalg::{evaluate_numeric, SymbolicTensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Raw,
    Sqp,
    LogRatio,
    LocalAffine,
    LocalMonomial,
}

/// Model outputs with gradients in global variable order.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvaluation {
    pub values: Vec<Quantity>,
    /// `jacobian[i][j] = ∂output_i / ∂v_j` for every global variable `j`.
    pub jacobian: Vec<Vec<Quantity>>,
    pub accuracy: Vec<GradientAccuracy>,
}

impl RuntimeEvaluation {
    pub fn is_degraded(&self) -> bool {
        self.accuracy.iter().any(|a| a.is_degraded())
    }
}

/// A residual (or ratio) and its numeric gradient for one output.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgedResidual {
    pub value: f64,
    pub gradient: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum ConstraintEvaluation {
    Raw(RuntimeEvaluation),
    Residuals(Vec<BridgedResidual>),
    Constraints(Vec<Constraint>),
}

pub struct RuntimeConstraintBridge<'a> {
    space: &'a VariableSpace,
    factors: Option<&'a [Quantity]>,
}

impl<'a> RuntimeConstraintBridge<'a> {
    /// A bridge over unscaled variables.
    pub fn new(space: &'a VariableSpace) -> Self {
        Self {
            space,
            factors: None,
        }
    }

    /// A bridge over scaled variables `xⱼ = factors[j] · vⱼ`.
    pub fn with_factors(space: &'a VariableSpace, factors: &'a [Quantity]) -> Self {
        Self {
            space,
            factors: Some(factors),
        }
    }

    pub fn evaluate(
        &self,
        rc: &RuntimeConstraint,
        point: &[f64],
        mode: BridgeMode,
    ) -> SolverResult<ConstraintEvaluation> {
        let raw = self.raw(rc, point)?;
        Ok(match mode {
            BridgeMode::Raw => ConstraintEvaluation::Raw(raw),
            BridgeMode::Sqp | BridgeMode::LogRatio => {
                ConstraintEvaluation::Residuals(self.residuals(rc, &raw, point, mode)?)
            }
            BridgeMode::LocalAffine => {
                ConstraintEvaluation::Constraints(self.local_affine(rc, &raw, point))
            }
            BridgeMode::LocalMonomial => {
                ConstraintEvaluation::Constraints(self.local_monomial(rc, &raw, point)?)
            }
        })
    }

    fn input_quantity(&self, j: usize, magnitude: f64) -> Quantity {
        let working = self.space.quantity(j, magnitude);
        match self.factors.and_then(|f| f.get(j)) {
            Some(factor) => factor * &working,
            None => working,
        }
    }

    /// Call the model and scatter its Jacobian into global order.
    pub fn raw(&self, rc: &RuntimeConstraint, point: &[f64]) -> SolverResult<RuntimeEvaluation> {
        let mut columns = Vec::with_capacity(rc.inputs.len());
        for name in &rc.inputs {
            let idx = self
                .space
                .index_of(name)
                .ok_or_else(|| EvaluationError::UnknownVariable(name.clone()))?;
            columns.push(idx);
        }
        let inputs: Vec<Quantity> = columns
            .iter()
            .map(|&j| self.input_quantity(j, point[j]))
            .collect();

        let eval = rc.call_model(&inputs)?;

        let n_out = rc.outputs.len();
        if eval.values.len() != n_out {
            return Err(DimensionError::LengthMismatch {
                context: format!("values returned by `{}`", rc.name),
                expected: n_out,
                found: eval.values.len(),
            }
            .into());
        }
        if eval.jacobian.len() != n_out {
            return Err(DimensionError::LengthMismatch {
                context: format!("jacobian rows returned by `{}`", rc.name),
                expected: n_out,
                found: eval.jacobian.len(),
            }
            .into());
        }

        let mut values = Vec::with_capacity(n_out);
        let mut jacobian = Vec::with_capacity(n_out);
        for (i, output) in rc.outputs.iter().enumerate() {
            let value = &eval.values[i];
            if value.unit != output.unit {
                return Err(DimensionError::UnitMismatch {
                    context: format!("output `{}` of `{}`", output.name, rc.name),
                    expected: output.unit.clone(),
                    found: value.unit.clone(),
                }
                .into());
            }
            if !value.is_finite() {
                return Err(EvaluationError::Undefined {
                    expression: format!("{}.{}", rc.name, output.name),
                    reason: format!("model returned {}", value.magnitude),
                }
                .into());
            }

            let row = &eval.jacobian[i];
            if row.len() != inputs.len() {
                return Err(DimensionError::RaggedRows {
                    row: i,
                    expected: inputs.len(),
                    found: row.len(),
                }
                .into());
            }

            // Zero entries carry unit(output) / unit(working variable).
            let mut scattered: Vec<Quantity> = (0..self.space.len())
                .map(|j| Quantity::zero(&output.unit / &self.space.unit(j)))
                .collect();
            for (k, &j) in columns.iter().enumerate() {
                let expected = &output.unit / &inputs[k].unit;
                if row[k].unit != expected {
                    return Err(DimensionError::UnitMismatch {
                        context: format!(
                            "∂{}/∂{} of `{}`",
                            output.name, rc.inputs[k], rc.name
                        ),
                        expected,
                        found: row[k].unit.clone(),
                    }
                    .into());
                }
                let entry = match self.factors.and_then(|f| f.get(j)) {
                    Some(factor) => &row[k] * factor,
                    None => row[k].clone(),
                };
                scattered[j] = Quantity::new(scattered[j].magnitude + entry.magnitude, entry.unit);
            }

            values.push(value.clone());
            jacobian.push(scattered);
        }

        let accuracy = (0..n_out).map(|i| eval.accuracy_of(i)).collect();
        Ok(RuntimeEvaluation {
            values,
            jacobian,
            accuracy,
        })
    }

    /// Residuals in the sign (`Sqp`) or ratio (`LogRatio`) convention.
    pub fn residuals(
        &self,
        rc: &RuntimeConstraint,
        raw: &RuntimeEvaluation,
        point: &[f64],
        mode: BridgeMode,
    ) -> SolverResult<Vec<BridgedResidual>> {
        let mut out = Vec::with_capacity(rc.outputs.len());
        for (i, output) in rc.outputs.iter().enumerate() {
            let m = raw.values[i].magnitude;
            let dm: Vec<f64> = raw.jacobian[i].iter().map(|q| q.magnitude).collect();
            let t = output.target.evaluate(self.space, point)?;
            let dt = evaluate_numeric(
                &SymbolicTensor::from_gradient(output.target.gradient(self.space)),
                self.space,
                point,
            )?
            .into_vector()?;
            let op = rc.operators[i];

            let residual = match mode {
                BridgeMode::LogRatio => {
                    if !(m > 0.0 && t > 0.0) {
                        return Err(EvaluationError::Undefined {
                            expression: format!("{}.{} / target", rc.name, output.name),
                            reason: format!(
                                "log-ratio needs positive output and target, got {m} and {t}"
                            ),
                        }
                        .into());
                    }
                    ratio(op, m, &dm, t, &dt)
                }
                _ => difference(op, m, &dm, t, &dt),
            };
            out.push(residual);
        }
        Ok(out)
    }

    /// `output ≈ m₀ + Σ ∂m/∂vⱼ·(vⱼ − v₀ⱼ)` as an explicit constraint per output.
    pub fn local_affine(
        &self,
        rc: &RuntimeConstraint,
        raw: &RuntimeEvaluation,
        point: &[f64],
    ) -> Vec<Constraint> {
        rc.outputs
            .iter()
            .enumerate()
            .map(|(i, output)| {
                let m0 = &raw.values[i];
                let mut offset = m0.magnitude;
                let mut terms = Vec::new();
                for (j, g) in raw.jacobian[i].iter().enumerate() {
                    if g.magnitude == 0.0 {
                        continue;
                    }
                    offset -= g.magnitude * point[j];
                    let name = self.variable_name(j);
                    terms.push(
                        Term::monomial(g.magnitude, &[(name.as_str(), 1.0)])
                            .with_unit(g.unit.clone()),
                    );
                }
                terms.push(Term::constant(Quantity::new(offset, output.unit.clone())));
                Constraint::new(
                    Signomial::from_terms(terms),
                    rc.operators[i],
                    output.target.clone(),
                )
                .with_label(format!("{}.{} (affine)", rc.name, output.name))
            })
            .collect()
    }

    /// `output ≈ m₀ · Π (vⱼ / v₀ⱼ)^eⱼ` with elasticities `eⱼ = v₀ⱼ·∂m/∂vⱼ / m₀`.
    ///
    /// Matches the model's value and gradient at the point; requires positive
    /// output and coordinates.
    pub fn local_monomial(
        &self,
        rc: &RuntimeConstraint,
        raw: &RuntimeEvaluation,
        point: &[f64],
    ) -> SolverResult<Vec<Constraint>> {
        let mut out = Vec::with_capacity(rc.outputs.len());
        for (i, output) in rc.outputs.iter().enumerate() {
            let m0 = raw.values[i].magnitude;
            if !(m0 > 0.0) {
                return Err(EvaluationError::Undefined {
                    expression: format!("{}.{}", rc.name, output.name),
                    reason: format!("monomial fit needs a positive output, got {m0}"),
                }
                .into());
            }
            let mut exponents = BTreeMap::new();
            let mut log_coefficient = m0.ln();
            let mut unit = output.unit.clone();
            for (j, g) in raw.jacobian[i].iter().enumerate() {
                if g.magnitude == 0.0 {
                    continue;
                }
                let v0 = point[j];
                if !(v0 > 0.0) {
                    return Err(EvaluationError::Undefined {
                        expression: format!("{}.{}", rc.name, output.name),
                        reason: format!(
                            "monomial fit needs positive coordinates, `{}` = {v0}",
                            self.variable_name(j)
                        ),
                    }
                    .into());
                }
                let e = v0 * g.magnitude / m0;
                log_coefficient -= e * v0.ln();
                unit = &unit / &self.space.unit(j).powf(e);
                exponents.insert(self.variable_name(j), e);
            }
            let term = Term {
                coefficient: log_coefficient.exp(),
                unit,
                exponents,
            };
            out.push(
                Constraint::new(term.into(), rc.operators[i], output.target.clone())
                    .with_label(format!("{}.{} (monomial)", rc.name, output.name)),
            );
        }
        Ok(out)
    }

    fn variable_name(&self, j: usize) -> String {
        self.space
            .get(j)
            .map(|v| v.name.clone())
            .unwrap_or_default()
    }
}

fn difference(op: Operator, m: f64, dm: &[f64], t: f64, dt: &[f64]) -> BridgedResidual {
    let sign = if op == Operator::GreaterEqual { -1.0 } else { 1.0 };
    BridgedResidual {
        value: sign * (m - t),
        gradient: dm.iter().zip(dt).map(|(a, b)| sign * (a - b)).collect(),
    }
}

fn ratio(op: Operator, m: f64, dm: &[f64], t: f64, dt: &[f64]) -> BridgedResidual {
    if op == Operator::GreaterEqual {
        // t/m
        BridgedResidual {
            value: t / m,
            gradient: dm
                .iter()
                .zip(dt)
                .map(|(a, b)| b / m - t * a / (m * m))
                .collect(),
        }
    } else {
        // m/t
        BridgedResidual {
            value: m / t,
            gradient: dm
                .iter()
                .zip(dt)
                .map(|(a, b)| a / t - m * b / (t * t))
                .collect(),
        }
    }
}

/// Unit of a working variable raised to a power, for callers assembling terms.
pub(crate) fn coefficient_unit(
    space: &VariableSpace,
    out: &Unit,
    exponents: &[(usize, f64)],
) -> Unit {
    let mut unit = out.clone();
    for &(j, e) in exponents {
        unit = &unit / &space.unit(j).powf(e);
    }
    unit
}
