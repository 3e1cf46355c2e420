//! Optimization problem definition.
//!
//! A [`Formulation`] bundles the variables, the objective, an ordered list of
//! constraints and the solver options. It is validated once, at construction:
//! names resolve, units agree, runtime constraints are well formed and the
//! options pass [`SolverOptions::validate`]. Solvers take their own working
//! copy and never modify the caller's formulation.

use crate::constraint::Constraint;
use crate::error::{ConfigurationError, EvaluationError};
use crate::expression::Signomial;
use crate::options::SolverOptions;
use crate::runtime::RuntimeConstraint;
use crate::units::Unit;
use crate::variable::{Variable, VariableSpace};

/// One entry of the ordered constraint list.
#[derive(Debug, Clone)]
pub enum ConstraintRow {
    Explicit(Constraint),
    Runtime(RuntimeConstraint),
}

impl ConstraintRow {
    pub fn name(&self) -> String {
        match self {
            ConstraintRow::Explicit(c) => c.display_name(),
            ConstraintRow::Runtime(rc) => rc.name.clone(),
        }
    }

    /// Number of scalar rows this entry contributes.
    pub fn row_count(&self) -> usize {
        match self {
            ConstraintRow::Explicit(_) => 1,
            ConstraintRow::Runtime(rc) => rc.outputs.len(),
        }
    }
}

impl From<Constraint> for ConstraintRow {
    fn from(c: Constraint) -> Self {
        ConstraintRow::Explicit(c)
    }
}

impl From<RuntimeConstraint> for ConstraintRow {
    fn from(rc: RuntimeConstraint) -> Self {
        ConstraintRow::Runtime(rc)
    }
}

#[derive(Debug, Clone)]
pub struct Formulation {
    variables: VariableSpace,
    objective: Signomial,
    constraints: Vec<ConstraintRow>,
    options: SolverOptions,
}

impl Formulation {
    pub fn new(
        variables: Vec<Variable>,
        objective: Signomial,
        constraints: Vec<ConstraintRow>,
        options: SolverOptions,
    ) -> Result<Self, ConfigurationError> {
        let variables = VariableSpace::new(variables)?;
        let formulation = Self {
            variables,
            objective,
            constraints,
            options,
        };
        formulation.validate()?;
        Ok(formulation)
    }

    /// Replace the options, re-validating them.
    pub fn with_options(mut self, options: SolverOptions) -> Result<Self, ConfigurationError> {
        self.options = options;
        self.validate()?;
        Ok(self)
    }

    pub fn variables(&self) -> &VariableSpace {
        &self.variables
    }

    pub fn objective(&self) -> &Signomial {
        &self.objective
    }

    pub fn constraints(&self) -> &[ConstraintRow] {
        &self.constraints
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Unit of the objective (dimensionless for a constant-free zero objective).
    pub fn objective_unit(&self) -> Unit {
        self.objective
            .unit_in(&self.variables)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// `x0` from the options where given, otherwise each variable's guess.
    pub fn starting_point(&self) -> Vec<f64> {
        self.variables
            .iter()
            .map(|v| {
                self.options
                    .x0
                    .as_ref()
                    .and_then(|x0| x0.get(&v.name))
                    .copied()
                    .unwrap_or(v.guess)
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        self.options.validate()?;

        if let Some(x0) = &self.options.x0 {
            for name in x0.keys() {
                if self.variables.index_of(name).is_none() {
                    return Err(ConfigurationError::UnknownVariable {
                        name: name.clone(),
                        context: "option `x0`".to_string(),
                    });
                }
            }
        }

        check_expression(&self.objective, &self.variables, "the objective")?;

        for row in &self.constraints {
            match row {
                ConstraintRow::Explicit(c) => {
                    let context = format!("constraint `{}`", c.display_name());
                    c.unit_in(&self.variables)
                        .map_err(|e| configuration_error(e, &context))?;
                }
                ConstraintRow::Runtime(rc) => self.validate_runtime(rc)?,
            }
        }
        Ok(())
    }

    fn validate_runtime(&self, rc: &RuntimeConstraint) -> Result<(), ConfigurationError> {
        for input in &rc.inputs {
            if self.variables.index_of(input).is_none() {
                return Err(ConfigurationError::UnknownVariable {
                    name: input.clone(),
                    context: format!("inputs of runtime constraint `{}`", rc.name),
                });
            }
        }
        for output in &rc.outputs {
            let context =
                format!("target of `{}` in runtime constraint `{}`", output.name, rc.name);
            if let Some(unit) = check_expression(&output.target, &self.variables, &context)? {
                if unit != output.unit {
                    return Err(ConfigurationError::UnitMismatch {
                        context,
                        source: crate::error::DimensionError::UnitMismatch {
                            context: format!("output `{}`", output.name),
                            expected: output.unit.clone(),
                            found: unit,
                        },
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_expression(
    expr: &Signomial,
    space: &VariableSpace,
    context: &str,
) -> Result<Option<Unit>, ConfigurationError> {
    expr.unit_in(space).map_err(|e| configuration_error(e, context))
}

fn configuration_error(err: EvaluationError, context: &str) -> ConfigurationError {
    match err {
        EvaluationError::UnknownVariable(name) => ConfigurationError::UnknownVariable {
            name,
            context: context.to_string(),
        },
        EvaluationError::Dimension(source) => ConfigurationError::UnitMismatch {
            context: context.to_string(),
            source,
        },
        other => ConfigurationError::invalid_option(context, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Operator;
    use crate::runtime::{AnalysisModel, ModelEvaluation, RuntimeOutput};
    use crate::units::Quantity;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn vars() -> Vec<Variable> {
        vec![
            Variable::new("x", 2.0, Unit::base("m")),
            Variable::new("y", 2.0, Unit::base("m")),
        ]
    }

    #[test]
    fn test_valid_formulation() {
        let x = Signomial::variable("x");
        let y = Signomial::variable("y");
        let objective = &x * &x + &y * &y;
        let c = Constraint::ge(&x + &y, Signomial::constant(Quantity::new(1.0, Unit::base("m"))));
        let f =
            Formulation::new(vars(), objective, vec![c.into()], SolverOptions::default()).unwrap();
        assert_eq!(f.objective_unit(), Unit::base("m").powf(2.0));
        assert_eq!(f.starting_point(), vec![2.0, 2.0]);
        assert_eq!(f.constraints()[0].row_count(), 1);
    }

    #[test]
    fn test_unit_mismatch_rejected() {
        let x = Signomial::variable("x");
        let c = Constraint::ge(x.clone(), Signomial::scalar(1.0));
        let err =
            Formulation::new(vars(), x, vec![c.into()], SolverOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnitMismatch { .. }));
    }

    #[test]
    fn test_unknown_names_rejected() {
        let z = Signomial::variable("z");
        let err = Formulation::new(vars(), z, vec![], SolverOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownVariable { ref name, .. } if name == "z"));

        let mut x0 = BTreeMap::new();
        x0.insert("w".to_string(), 1.0);
        let options = SolverOptions {
            x0: Some(x0),
            ..SolverOptions::default()
        };
        let err = Formulation::new(vars(), Signomial::variable("x"), vec![], options).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownVariable { .. }));
    }

    #[test]
    fn test_runtime_target_unit_checked() {
        let model: Arc<dyn AnalysisModel> =
            Arc::new(|_: &[Quantity]| -> anyhow::Result<ModelEvaluation> {
                anyhow::bail!("never called")
            });
        let rc = RuntimeConstraint::new(
            "sum",
            vec!["x".to_string(), "y".to_string()],
            vec![RuntimeOutput::new("s", Unit::base("m"), Signomial::scalar(1.0))],
            vec![Operator::GreaterEqual],
            model,
        )
        .unwrap();
        let x = Signomial::variable("x");
        let err =
            Formulation::new(vars(), x, vec![rc.into()], SolverOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnitMismatch { .. }));
    }

    #[test]
    fn test_x0_overrides_guess() {
        let mut x0 = BTreeMap::new();
        x0.insert("y".to_string(), 5.0);
        let options = SolverOptions {
            x0: Some(x0),
            ..SolverOptions::default()
        };
        let f = Formulation::new(vars(), Signomial::variable("x"), vec![], options).unwrap();
        assert_eq!(f.starting_point(), vec![2.0, 5.0]);
    }
}
