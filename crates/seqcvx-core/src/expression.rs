//! Signomial expressions.
//!
//! A [`Signomial`] is a finite sum of power-law [`Term`]s,
//!
//! ```text
//! f(x) = Σₖ cₖ · Πⱼ xⱼ^aₖⱼ
//! ```
//!
//! with real coefficients and real exponents. This is enough to express every
//! objective and explicit constraint the sequential solvers consume, and it is
//! closed under the operations they need:
//!
//! | operation | used by |
//! |-----------|---------|
//! | [`Signomial::evaluate`], [`Signomial::gradient`] | linearization in every mode |
//! | [`Signomial::rescaled`] | variable scaling `x = g·v` |
//! | [`Signomial::split_signs`] | posynomial form `P − N` of a constraint |
//! | [`Signomial::condensed_at`] | monomial approximation of a posynomial (GP modes) |
//!
//! A posynomial is a signomial with only positive coefficients; a monomial is a
//! single positive term. Posynomials are log-convex in `y = ln x`, which is what
//! makes the geometric-program subproblems convex.
//!
//! # Units
//!
//! Each term stores the unit of its *coefficient*. The unit of the whole term is
//! the coefficient unit times `Πⱼ unit(xⱼ)^aₖⱼ`, which is only known once a
//! [`VariableSpace`] is available. [`Signomial::unit_in`] checks that all terms
//! agree. Evaluation itself works on plain magnitudes.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{DimensionError, EvaluationError};
use crate::units::{Quantity, Unit};
use crate::variable::VariableSpace;

const EXPONENT_EPS: f64 = 1e-12;

/// One power-law term `c · Π xⱼ^aⱼ`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub coefficient: f64,
    /// Unit of the coefficient alone.
    pub unit: Unit,
    pub exponents: BTreeMap<String, f64>,
}

impl Term {
    /// A constant term.
    pub fn constant(value: Quantity) -> Self {
        Self {
            coefficient: value.magnitude,
            unit: value.unit,
            exponents: BTreeMap::new(),
        }
    }

    /// A dimensionless coefficient times a product of powers.
    pub fn monomial(coefficient: f64, powers: &[(&str, f64)]) -> Self {
        let mut exponents = BTreeMap::new();
        for (name, power) in powers {
            *exponents.entry(name.to_string()).or_insert(0.0) += power;
        }
        exponents.retain(|_, a| a.abs() > EXPONENT_EPS);
        Self {
            coefficient,
            unit: Unit::dimensionless(),
            exponents,
        }
    }

    /// Replace the coefficient unit.
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Exponent of a variable in this term (zero when absent).
    pub fn exponent(&self, name: &str) -> f64 {
        self.exponents.get(name).copied().unwrap_or(0.0)
    }

    pub fn is_constant(&self) -> bool {
        self.exponents.is_empty()
    }

    /// Unit of the full term in a given variable space.
    pub fn unit_in(&self, space: &VariableSpace) -> Result<Unit, EvaluationError> {
        let mut unit = self.unit.clone();
        for (name, power) in &self.exponents {
            let idx = space
                .index_of(name)
                .ok_or_else(|| EvaluationError::UnknownVariable(name.clone()))?;
            unit = &unit * &space.unit(idx).powf(*power);
        }
        Ok(unit)
    }

    /// Numeric value at `x` (magnitudes ordered like `space`).
    pub fn evaluate(&self, space: &VariableSpace, x: &[f64]) -> Result<f64, EvaluationError> {
        let mut value = self.coefficient;
        for (name, power) in &self.exponents {
            let idx = space
                .index_of(name)
                .ok_or_else(|| EvaluationError::UnknownVariable(name.clone()))?;
            value *= x[idx].powf(*power);
        }
        Ok(value)
    }

    /// Dense exponent vector ordered like `space`.
    pub fn exponent_vector(&self, space: &VariableSpace) -> Result<Vec<f64>, EvaluationError> {
        let mut out = vec![0.0; space.len()];
        for (name, power) in &self.exponents {
            let idx = space
                .index_of(name)
                .ok_or_else(|| EvaluationError::UnknownVariable(name.clone()))?;
            out[idx] = *power;
        }
        Ok(out)
    }

    fn times(&self, other: &Term) -> Term {
        let mut exponents = self.exponents.clone();
        for (name, power) in &other.exponents {
            *exponents.entry(name.clone()).or_insert(0.0) += power;
        }
        exponents.retain(|_, a| a.abs() > EXPONENT_EPS);
        Term {
            coefficient: self.coefficient * other.coefficient,
            unit: &self.unit * &other.unit,
            exponents,
        }
    }

    fn same_powers(&self, other: &Term) -> bool {
        self.exponents.len() == other.exponents.len()
            && self.exponents.iter().all(|(name, a)| {
                other
                    .exponents
                    .get(name)
                    .is_some_and(|b| (a - b).abs() <= EXPONENT_EPS)
            })
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.coefficient)?;
        for (name, power) in &self.exponents {
            if (power - 1.0).abs() <= EXPONENT_EPS {
                write!(f, "*{name}")?;
            } else {
                write!(f, "*{name}^{power}")?;
            }
        }
        Ok(())
    }
}

/// A sum of [`Term`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signomial {
    pub terms: Vec<Term>,
}

impl Signomial {
    pub fn from_terms(terms: Vec<Term>) -> Self {
        Self { terms }.simplified()
    }

    /// The zero expression.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(value: Quantity) -> Self {
        Self::from_terms(vec![Term::constant(value)])
    }

    /// A dimensionless constant.
    pub fn scalar(value: f64) -> Self {
        Self::constant(Quantity::dimensionless(value))
    }

    /// The bare variable `name`.
    pub fn variable(name: &str) -> Self {
        Self::from_terms(vec![Term::monomial(1.0, &[(name, 1.0)])])
    }

    pub fn monomial(coefficient: f64, powers: &[(&str, f64)]) -> Self {
        Self::from_terms(vec![Term::monomial(coefficient, powers)])
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    /// A single term with a positive coefficient.
    pub fn is_monomial(&self) -> bool {
        self.terms.len() == 1 && self.terms[0].coefficient > 0.0
    }

    /// All coefficients positive (the empty sum is not a posynomial).
    pub fn is_posynomial(&self) -> bool {
        !self.terms.is_empty() && self.terms.iter().all(|t| t.coefficient > 0.0)
    }

    /// Merge terms with identical powers and coefficient units; drop zeros.
    pub fn simplified(&self) -> Self {
        let mut merged: Vec<Term> = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            match merged
                .iter_mut()
                .find(|m| m.same_powers(term) && m.unit == term.unit)
            {
                Some(existing) => existing.coefficient += term.coefficient,
                None => merged.push(term.clone()),
            }
        }
        merged.retain(|t| t.coefficient != 0.0);
        Self { terms: merged }
    }

    /// Names of all variables the expression depends on.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .terms
            .iter()
            .flat_map(|t| t.exponents.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Unit of the expression, or `None` for the zero expression.
    ///
    /// Fails with a unit mismatch when two terms disagree.
    pub fn unit_in(&self, space: &VariableSpace) -> Result<Option<Unit>, EvaluationError> {
        let mut unit: Option<Unit> = None;
        for term in &self.terms {
            let term_unit = term.unit_in(space)?;
            match &unit {
                None => unit = Some(term_unit),
                Some(u) if *u == term_unit => {}
                Some(u) => {
                    return Err(DimensionError::UnitMismatch {
                        context: format!("expression `{self}`"),
                        expected: u.clone(),
                        found: term_unit,
                    }
                    .into())
                }
            }
        }
        Ok(unit)
    }

    /// Numeric value at `x`. Non-finite results are reported as undefined.
    pub fn evaluate(&self, space: &VariableSpace, x: &[f64]) -> Result<f64, EvaluationError> {
        let mut total = 0.0;
        for term in &self.terms {
            total += term.evaluate(space, x)?;
        }
        if total.is_finite() {
            Ok(total)
        } else {
            Err(EvaluationError::Undefined {
                expression: self.to_string(),
                reason: format!("evaluates to {total}"),
            })
        }
    }

    /// Value with its unit attached.
    pub fn substitute(
        &self,
        space: &VariableSpace,
        x: &[f64],
    ) -> Result<Quantity, EvaluationError> {
        let magnitude = self.evaluate(space, x)?;
        let unit = self.unit_in(space)?.unwrap_or_default();
        Ok(Quantity::new(magnitude, unit))
    }

    /// Symbolic partial derivative with respect to `name`.
    pub fn derivative(&self, name: &str) -> Signomial {
        let terms = self
            .terms
            .iter()
            .filter_map(|t| {
                let power = t.exponent(name);
                if power.abs() <= EXPONENT_EPS {
                    return None;
                }
                let mut d = t.clone();
                d.coefficient *= power;
                let reduced = power - 1.0;
                if reduced.abs() <= EXPONENT_EPS {
                    d.exponents.remove(name);
                } else {
                    d.exponents.insert(name.to_string(), reduced);
                }
                Some(d)
            })
            .collect();
        Signomial::from_terms(terms)
    }

    /// Symbolic gradient ordered like `space`.
    pub fn gradient(&self, space: &VariableSpace) -> Vec<Signomial> {
        space.iter().map(|v| self.derivative(&v.name)).collect()
    }

    /// Symbolic Hessian ordered like `space`.
    pub fn hessian(&self, space: &VariableSpace) -> Vec<Vec<Signomial>> {
        self.gradient(space)
            .iter()
            .map(|row| row.gradient(space))
            .collect()
    }

    /// Substitute `xⱼ = gⱼ · vⱼ` for the variables in `factors`.
    ///
    /// The factor's magnitude and unit move into each term's coefficient, so the
    /// rescaled expression is meant to be read with dimensionless `vⱼ`.
    pub fn rescaled(&self, factors: &BTreeMap<String, Quantity>) -> Signomial {
        let terms = self
            .terms
            .iter()
            .map(|t| {
                let mut scaled = t.clone();
                for (name, power) in &t.exponents {
                    if let Some(g) = factors.get(name) {
                        scaled.coefficient *= g.magnitude.powf(*power);
                        scaled.unit = &scaled.unit * &g.unit.powf(*power);
                    }
                }
                scaled
            })
            .collect();
        Signomial::from_terms(terms)
    }

    /// Split into posynomials `(P, N)` with `self = P − N`.
    pub fn split_signs(&self) -> (Signomial, Signomial) {
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for term in &self.simplified().terms {
            if term.coefficient > 0.0 {
                positive.push(term.clone());
            } else {
                let mut flipped = term.clone();
                flipped.coefficient = -flipped.coefficient;
                negative.push(flipped);
            }
        }
        (Signomial { terms: positive }, Signomial { terms: negative })
    }

    /// Divide every term by a monomial.
    pub fn divide_by_monomial(&self, monomial: &Term) -> Signomial {
        let mut inverse = BTreeMap::new();
        for (name, power) in &monomial.exponents {
            inverse.insert(name.clone(), -power);
        }
        let reciprocal = Term {
            coefficient: 1.0 / monomial.coefficient,
            unit: Unit::dimensionless() / monomial.unit.clone(),
            exponents: inverse,
        };
        Signomial {
            terms: self.terms.iter().map(|t| t.times(&reciprocal)).collect(),
        }
        .simplified()
    }

    /// Best local monomial approximation of a posynomial at `x`.
    ///
    /// Uses the arithmetic–geometric mean inequality with weights
    /// `wₖ = uₖ(x) / P(x)`:
    ///
    /// ```text
    /// P(x) = Σₖ uₖ(x)  ≥  Πₖ (uₖ(x) / wₖ)^wₖ
    /// ```
    ///
    /// The returned monomial matches `P` in value and gradient at `x` and
    /// under-estimates it everywhere else, so `P ≤ M̂` style constraints built
    /// from it are conservative.
    pub fn condensed_at(&self, space: &VariableSpace, x: &[f64]) -> Result<Term, EvaluationError> {
        if !self.is_posynomial() {
            return Err(EvaluationError::Undefined {
                expression: self.to_string(),
                reason: "only posynomials can be condensed to a monomial".to_string(),
            });
        }
        if self.terms.len() == 1 {
            return Ok(self.terms[0].clone());
        }

        let values = self
            .terms
            .iter()
            .map(|t| t.evaluate(space, x))
            .collect::<Result<Vec<_>, _>>()?;
        let total: f64 = values.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(EvaluationError::Undefined {
                expression: self.to_string(),
                reason: format!("posynomial evaluates to {total}"),
            });
        }

        let mut log_coefficient = 0.0;
        let mut unit = Unit::dimensionless();
        let mut exponents: BTreeMap<String, f64> = BTreeMap::new();
        for (term, value) in self.terms.iter().zip(&values) {
            let weight = value / total;
            if weight <= 0.0 {
                continue;
            }
            log_coefficient += weight * (term.coefficient / weight).ln();
            unit = &unit * &term.unit.powf(weight);
            for (name, power) in &term.exponents {
                *exponents.entry(name.clone()).or_insert(0.0) += weight * power;
            }
        }
        exponents.retain(|_, a| a.abs() > EXPONENT_EPS);

        Ok(Term {
            coefficient: log_coefficient.exp(),
            unit,
            exponents,
        })
    }
}

impl From<Term> for Signomial {
    fn from(term: Term) -> Self {
        Signomial::from_terms(vec![term])
    }
}

impl fmt::Display for Signomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " + ")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

impl Add for Signomial {
    type Output = Signomial;
    fn add(mut self, rhs: Signomial) -> Signomial {
        self.terms.extend(rhs.terms);
        self.simplified()
    }
}

impl Add for &Signomial {
    type Output = Signomial;
    fn add(self, rhs: &Signomial) -> Signomial {
        self.clone() + rhs.clone()
    }
}

impl Sub for Signomial {
    type Output = Signomial;
    fn sub(self, rhs: Signomial) -> Signomial {
        self + (-rhs)
    }
}

impl Sub for &Signomial {
    type Output = Signomial;
    fn sub(self, rhs: &Signomial) -> Signomial {
        self.clone() - rhs.clone()
    }
}

impl Neg for Signomial {
    type Output = Signomial;
    fn neg(mut self) -> Signomial {
        for term in &mut self.terms {
            term.coefficient = -term.coefficient;
        }
        self
    }
}

impl Mul for &Signomial {
    type Output = Signomial;
    fn mul(self, rhs: &Signomial) -> Signomial {
        let mut terms = Vec::with_capacity(self.terms.len() * rhs.terms.len());
        for a in &self.terms {
            for b in &rhs.terms {
                terms.push(a.times(b));
            }
        }
        Signomial::from_terms(terms)
    }
}

impl Mul for Signomial {
    type Output = Signomial;
    fn mul(self, rhs: Signomial) -> Signomial {
        &self * &rhs
    }
}

impl Mul<f64> for Signomial {
    type Output = Signomial;
    fn mul(mut self, rhs: f64) -> Signomial {
        for term in &mut self.terms {
            term.coefficient *= rhs;
        }
        self.simplified()
    }
}
