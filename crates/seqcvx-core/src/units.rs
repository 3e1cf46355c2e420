//! Runtime-tagged physical quantities.
//!
//! Variables, black-box model outputs and their Jacobians carry physical units.
//! The solver core never does unit algebra of its own: it only needs to
//!
//! - multiply and divide units (gradient entries are `unit(output) / unit(input)`),
//! - compare units (runtime Jacobian rows must match the declared output units),
//! - produce a correctly dimensioned zero (gradient scatter), and
//! - strip the unit off at the linear-algebra boundary.
//!
//! A [`Unit`] is a product of named base symbols raised to real exponents, so
//! `m/s^2` is `{m: 1, s: -2}`. A [`Quantity`] is a magnitude paired with a unit.
//!
//! # Usage
//!
//! ```
//! use seqcvx_core::units::{Quantity, Unit};
//!
//! let metre = Unit::base("m");
//! let second = Unit::base("s");
//!
//! let distance = Quantity::new(12.0, metre.clone());
//! let time = Quantity::new(4.0, second);
//! let speed = &distance / &time;
//!
//! assert_eq!(speed.magnitude, 3.0);
//! assert_eq!(speed.unit.to_string(), "m·s^-1");
//!
//! // Addition is checked: metres cannot be added to seconds.
//! assert!(distance.checked_add(&time).is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Div, Mul, Neg};

use serde::{Deserialize, Serialize};

use crate::error::DimensionError;

/// Exponents closer than this are treated as equal (and as zero when pruning).
const EXPONENT_EPS: f64 = 1e-12;

/// Product of base symbols raised to real exponents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Unit {
    dims: BTreeMap<String, f64>,
}

impl Unit {
    /// The unit of a pure number.
    pub fn dimensionless() -> Self {
        Self::default()
    }

    /// A single base symbol, e.g. `Unit::base("m")`.
    pub fn base(symbol: &str) -> Self {
        let mut dims = BTreeMap::new();
        dims.insert(symbol.to_string(), 1.0);
        Self { dims }
    }

    /// Build a unit from `(symbol, exponent)` pairs.
    pub fn from_dims<'a>(dims: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut unit = Self::default();
        for (symbol, exponent) in dims {
            *unit.dims.entry(symbol.to_string()).or_insert(0.0) += exponent;
        }
        unit.pruned()
    }

    /// Check whether this unit has no remaining dimensions.
    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_empty()
    }

    /// Raise the unit to a real power.
    pub fn powf(&self, exponent: f64) -> Self {
        Self {
            dims: self
                .dims
                .iter()
                .map(|(k, v)| (k.clone(), v * exponent))
                .collect(),
        }
        .pruned()
    }

    /// Exponent of a base symbol (zero when absent).
    pub fn exponent(&self, symbol: &str) -> f64 {
        self.dims.get(symbol).copied().unwrap_or(0.0)
    }

    fn pruned(mut self) -> Self {
        self.dims.retain(|_, v| v.abs() > EXPONENT_EPS);
        self
    }

    fn combine(&self, other: &Unit, sign: f64) -> Unit {
        let mut dims = self.dims.clone();
        for (symbol, exponent) in &other.dims {
            *dims.entry(symbol.clone()).or_insert(0.0) += sign * exponent;
        }
        Unit { dims }.pruned()
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len()
            && self.dims.iter().all(|(k, v)| {
                other
                    .dims
                    .get(k)
                    .is_some_and(|w| (v - w).abs() <= EXPONENT_EPS)
            })
    }
}

impl Mul for &Unit {
    type Output = Unit;
    fn mul(self, rhs: &Unit) -> Unit {
        self.combine(rhs, 1.0)
    }
}

impl Mul for Unit {
    type Output = Unit;
    fn mul(self, rhs: Unit) -> Unit {
        self.combine(&rhs, 1.0)
    }
}

impl Div for &Unit {
    type Output = Unit;
    fn div(self, rhs: &Unit) -> Unit {
        self.combine(rhs, -1.0)
    }
}

impl Div for Unit {
    type Output = Unit;
    fn div(self, rhs: Unit) -> Unit {
        self.combine(&rhs, -1.0)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "dimensionless");
        }
        let mut first = true;
        for (symbol, exponent) in &self.dims {
            if !first {
                write!(f, "·")?;
            }
            first = false;
            if (exponent - 1.0).abs() <= EXPONENT_EPS {
                write!(f, "{symbol}")?;
            } else if (exponent - exponent.round()).abs() <= EXPONENT_EPS {
                write!(f, "{symbol}^{}", exponent.round() as i64)?;
            } else {
                write!(f, "{symbol}^{exponent}")?;
            }
        }
        Ok(())
    }
}

/// A magnitude tagged with its unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: Unit,
}

impl Quantity {
    /// Create a new quantity
    pub fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    /// A pure number.
    pub fn dimensionless(magnitude: f64) -> Self {
        Self::new(magnitude, Unit::dimensionless())
    }

    /// Zero in the given unit.
    pub fn zero(unit: Unit) -> Self {
        Self::new(0.0, unit)
    }

    /// Add two quantities of the same unit.
    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity, DimensionError> {
        self.ensure_same_unit(other, "addition")?;
        Ok(Quantity::new(self.magnitude + other.magnitude, self.unit.clone()))
    }

    /// Subtract two quantities of the same unit.
    pub fn checked_sub(&self, other: &Quantity) -> Result<Quantity, DimensionError> {
        self.ensure_same_unit(other, "subtraction")?;
        Ok(Quantity::new(self.magnitude - other.magnitude, self.unit.clone()))
    }

    /// Strip the unit, requiring the quantity to be dimensionless.
    pub fn to_dimensionless(&self) -> Result<f64, DimensionError> {
        if self.unit.is_dimensionless() {
            Ok(self.magnitude)
        } else {
            Err(DimensionError::UnitMismatch {
                context: "conversion to a pure number".to_string(),
                expected: Unit::dimensionless(),
                found: self.unit.clone(),
            })
        }
    }

    /// Check if the magnitude is finite
    pub fn is_finite(&self) -> bool {
        self.magnitude.is_finite()
    }

    fn ensure_same_unit(&self, other: &Quantity, context: &str) -> Result<(), DimensionError> {
        if self.unit == other.unit {
            Ok(())
        } else {
            Err(DimensionError::UnitMismatch {
                context: context.to_string(),
                expected: self.unit.clone(),
                found: other.unit.clone(),
            })
        }
    }
}

impl Mul<f64> for Quantity {
    type Output = Quantity;
    fn mul(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude * rhs, self.unit)
    }
}

impl Mul<f64> for &Quantity {
    type Output = Quantity;
    fn mul(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude * rhs, self.unit.clone())
    }
}

impl Mul for &Quantity {
    type Output = Quantity;
    fn mul(self, rhs: &Quantity) -> Quantity {
        Quantity::new(self.magnitude * rhs.magnitude, &self.unit * &rhs.unit)
    }
}

impl Div for &Quantity {
    type Output = Quantity;
    fn div(self, rhs: &Quantity) -> Quantity {
        Quantity::new(self.magnitude / rhs.magnitude, &self.unit / &rhs.unit)
    }
}

impl Neg for Quantity {
    type Output = Quantity;
    fn neg(self) -> Quantity {
        Quantity::new(-self.magnitude, self.unit)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_dimensionless() {
            write!(f, "{:.6}", self.magnitude)
        } else {
            write!(f, "{:.6} {}", self.magnitude, self.unit)
        }
    }
}
