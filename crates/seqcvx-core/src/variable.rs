//! Design variables and the ordered variable space.
//!
//! Every numeric vector in the solver is indexed by position in a
//! [`VariableSpace`]. Expressions refer to variables by name and resolve the
//! position through the space's index, so the space is the single source of
//! truth for ordering.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::units::{Quantity, Unit};

/// A named design variable with a unit and a starting guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub unit: Unit,
    /// Starting guess, expressed in `unit`.
    pub guess: f64,
}

impl Variable {
    pub fn new(name: impl Into<String>, guess: f64, unit: Unit) -> Self {
        Self {
            name: name.into(),
            unit,
            guess,
        }
    }

    /// A variable without physical dimensions.
    pub fn dimensionless(name: impl Into<String>, guess: f64) -> Self {
        Self::new(name, guess, Unit::dimensionless())
    }

    /// The guess as a unit-tagged quantity.
    pub fn guess_quantity(&self) -> Quantity {
        Quantity::new(self.guess, self.unit.clone())
    }
}

/// Ordered, name-indexed collection of variables.
#[derive(Debug, Clone, Default)]
pub struct VariableSpace {
    variables: Vec<Variable>,
    index: HashMap<String, usize>,
}

impl VariableSpace {
    /// Build a space, rejecting duplicate names.
    pub fn new(variables: Vec<Variable>) -> Result<Self, ConfigurationError> {
        let mut index = HashMap::with_capacity(variables.len());
        for (i, var) in variables.iter().enumerate() {
            if index.insert(var.name.clone(), i).is_some() {
                return Err(ConfigurationError::DuplicateVariable(var.name.clone()));
            }
        }
        Ok(Self { variables, index })
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Position of a variable by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, i: usize) -> Option<&Variable> {
        self.variables.get(i)
    }

    /// Unit of the `i`-th variable (dimensionless when out of range).
    pub fn unit(&self, i: usize) -> Unit {
        self.variables
            .get(i)
            .map(|v| v.unit.clone())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.name.clone()).collect()
    }

    pub fn guesses(&self) -> Vec<f64> {
        self.variables.iter().map(|v| v.guess).collect()
    }

    /// Tag the magnitude of the `i`-th coordinate with its variable's unit.
    pub fn quantity(&self, i: usize, magnitude: f64) -> Quantity {
        Quantity::new(magnitude, self.unit(i))
    }
}
