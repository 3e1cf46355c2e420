//! Explicit (symbolic) constraints.
//!
//! A [`Constraint`] is an immutable `lhs op rhs` relation between two
//! signomials. Every transform returns a new value; nothing is rewritten in
//! place, so a working copy held by a solver can never alias the caller's
//! formulation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, EvaluationError};
use crate::expression::Signomial;
use crate::units::Unit;
use crate::variable::VariableSpace;

/// Relational operator of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = ">=")]
    GreaterEqual,
}

impl Operator {
    /// The operator obtained by exchanging (or negating) both sides.
    pub fn flipped(self) -> Self {
        match self {
            Operator::Equal => Operator::Equal,
            Operator::LessEqual => Operator::GreaterEqual,
            Operator::GreaterEqual => Operator::LessEqual,
        }
    }

    pub fn is_equality(self) -> bool {
        matches!(self, Operator::Equal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::LessEqual => "<=",
            Operator::GreaterEqual => ">=",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" | "=" => Ok(Operator::Equal),
            "<=" => Ok(Operator::LessEqual),
            ">=" => Ok(Operator::GreaterEqual),
            other => Err(ConfigurationError::invalid_option(
                "operator",
                format!("unknown operator `{other}`"),
            )),
        }
    }
}

/// `lhs op rhs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub lhs: Signomial,
    pub operator: Operator,
    pub rhs: Signomial,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Constraint {
    pub fn new(lhs: Signomial, operator: Operator, rhs: Signomial) -> Self {
        Self {
            lhs,
            operator,
            rhs,
            label: None,
        }
    }

    pub fn le(lhs: Signomial, rhs: Signomial) -> Self {
        Self::new(lhs, Operator::LessEqual, rhs)
    }

    pub fn ge(lhs: Signomial, rhs: Signomial) -> Self {
        Self::new(lhs, Operator::GreaterEqual, rhs)
    }

    pub fn eq(lhs: Signomial, rhs: Signomial) -> Self {
        Self::new(lhs, Operator::Equal, rhs)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label for messages; falls back to the printed relation.
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.to_string())
    }

    /// `-lhs op' -rhs`
    pub fn negated(&self) -> Constraint {
        Constraint {
            lhs: -self.lhs.clone(),
            operator: self.operator.flipped(),
            rhs: -self.rhs.clone(),
            label: self.label.clone(),
        }
    }

    /// `rhs op' lhs`
    pub fn swapped(&self) -> Constraint {
        Constraint {
            lhs: self.rhs.clone(),
            operator: self.operator.flipped(),
            rhs: self.lhs.clone(),
            label: self.label.clone(),
        }
    }

    /// `(lhs − rhs) op 0`
    pub fn zeroed(&self) -> Constraint {
        Constraint {
            lhs: &self.lhs - &self.rhs,
            operator: self.operator,
            rhs: Signomial::zero(),
            label: self.label.clone(),
        }
    }

    /// `P op N` where `lhs − rhs = P − N` and both sides are posynomials
    /// (either side may be empty).
    pub fn to_all_positive(&self) -> Constraint {
        let (positive, negative) = (&self.lhs - &self.rhs).split_signs();
        Constraint {
            lhs: positive,
            operator: self.operator,
            rhs: negative,
            label: self.label.clone(),
        }
    }

    /// Whether the relation is a valid geometric-program constraint as written
    /// in all-positive form: posynomial ≤ monomial, or monomial == monomial.
    pub fn is_gp_compatible(&self) -> bool {
        let positive = self.to_all_positive();
        let (p, n) = (&positive.lhs, &positive.rhs);
        match self.operator {
            Operator::LessEqual => p.is_posynomial() && n.is_monomial(),
            Operator::GreaterEqual => n.is_posynomial() && p.is_monomial(),
            Operator::Equal => p.is_monomial() && n.is_monomial(),
        }
    }

    /// Common unit of both sides (`None` when both are zero).
    pub fn unit_in(&self, space: &VariableSpace) -> Result<Option<Unit>, EvaluationError> {
        let lhs = self.lhs.unit_in(space)?;
        let rhs = self.rhs.unit_in(space)?;
        match (lhs, rhs) {
            (Some(a), Some(b)) if a != b => Err(crate::error::DimensionError::UnitMismatch {
                context: format!("constraint `{}`", self.display_name()),
                expected: a,
                found: b,
            }
            .into()),
            (Some(a), _) => Ok(Some(a)),
            (None, b) => Ok(b),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.operator, self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Variable;

    #[test]
    fn test_operator_parsing() {
        assert_eq!("<=".parse::<Operator>().unwrap(), Operator::LessEqual);
        assert_eq!(">=".parse::<Operator>().unwrap(), Operator::GreaterEqual);
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Equal);
        assert!("<".parse::<Operator>().is_err());
    }

    #[test]
    fn test_transforms_are_pure() {
        let c = Constraint::ge(
            Signomial::variable("x") + Signomial::variable("y"),
            Signomial::scalar(1.0),
        );
        let before = c.clone();

        let n = c.negated();
        assert_eq!(n.operator, Operator::LessEqual);
        let s = c.swapped();
        assert_eq!(s.operator, Operator::LessEqual);
        assert_eq!(s.rhs, c.lhs);
        let z = c.zeroed();
        assert!(z.rhs.is_zero());

        assert_eq!(c, before);
    }

    #[test]
    fn test_all_positive_form() {
        // x·y − 4 <= 0  →  x·y <= 4
        let xy = Signomial::monomial(1.0, &[("x", 1.0), ("y", 1.0)]);
        let c = Constraint::le(xy, Signomial::scalar(4.0));
        let p = c.to_all_positive();
        assert!(p.lhs.is_monomial());
        assert!(p.rhs.is_monomial());
        assert!(c.is_gp_compatible());

        // x + y >= 1 is GP compatible (1 <= x + y reads posynomial >= monomial)
        let sum = Signomial::variable("x") + Signomial::variable("y");
        let c = Constraint::ge(sum, Signomial::scalar(1.0));
        assert!(c.is_gp_compatible());

        // x + y <= 1 + z is not
        let c = Constraint::le(
            Signomial::variable("x") + Signomial::variable("y"),
            Signomial::scalar(1.0) + Signomial::variable("z"),
        );
        assert!(!c.is_gp_compatible());
    }

    #[test]
    fn test_unit_check() {
        let space = VariableSpace::new(vec![
            Variable::new("x", 1.0, Unit::base("m")),
            Variable::new("t", 1.0, Unit::base("s")),
        ])
        .unwrap();
        let good = Constraint::le(Signomial::variable("x"), Signomial::variable("x") * 2.0);
        assert_eq!(good.unit_in(&space).unwrap(), Some(Unit::base("m")));
        let bad = Constraint::le(Signomial::variable("x"), Signomial::variable("t"));
        assert!(bad.unit_in(&space).is_err());
    }
}
