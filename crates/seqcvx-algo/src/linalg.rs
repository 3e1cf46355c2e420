//! Boundary between unit-tagged symbolic quantities and plain numeric arrays.
//!
//! Gradients and Hessians arrive either as symbolic expressions (explicit
//! constraints) or as unit-tagged quantities (runtime models). The convex
//! backends only understand `f64`. This module converts one into the other:
//!
//! ```text
//! SymbolicTensor ──substitute_matrix──► QuantityTensor ──strip_units──► NumericTensor
//! ```
//!
//! Vector and matrix shapes are explicit variants rather than being inferred by
//! probing the first row, and ragged input fails with
//! [`DimensionError::RaggedRows`].
//!
//! The rest of the module holds the small dense helpers the solvers share,
//! including a direct solve through faer's partial-pivoting LU.

use faer::{prelude::*, solvers::PartialPivLu, Mat};
use seqcvx_core::{DimensionError, Quantity, Signomial, VariableSpace};

use crate::error::SolverResult;

/// One entry of a symbolic tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// Already a concrete value.
    Value(Quantity),
    /// An expression to substitute at a point.
    Symbolic(Signomial),
}

impl Entry {
    fn substitute(&self, space: &VariableSpace, point: &[f64]) -> SolverResult<Quantity> {
        match self {
            Entry::Value(q) => Ok(q.clone()),
            Entry::Symbolic(expr) => Ok(expr.substitute(space, point)?),
        }
    }

    fn evaluate(&self, space: &VariableSpace, point: &[f64]) -> SolverResult<f64> {
        match self {
            Entry::Value(q) => Ok(q.magnitude),
            Entry::Symbolic(expr) => Ok(expr.evaluate(space, point)?),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolicTensor {
    Vector(Vec<Entry>),
    Matrix(Vec<Vec<Entry>>),
}

impl SymbolicTensor {
    pub fn from_gradient(gradient: Vec<Signomial>) -> Self {
        SymbolicTensor::Vector(gradient.into_iter().map(Entry::Symbolic).collect())
    }

    pub fn from_hessian(hessian: Vec<Vec<Signomial>>) -> Self {
        SymbolicTensor::Matrix(
            hessian
                .into_iter()
                .map(|row| row.into_iter().map(Entry::Symbolic).collect())
                .collect(),
        )
    }

    pub fn from_quantities(rows: Vec<Vec<Quantity>>) -> Self {
        SymbolicTensor::Matrix(
            rows.into_iter()
                .map(|row| row.into_iter().map(Entry::Value).collect())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuantityTensor {
    Vector(Vec<Quantity>),
    Matrix(Vec<Vec<Quantity>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumericTensor {
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
}

impl NumericTensor {
    pub fn into_vector(self) -> Result<Vec<f64>, DimensionError> {
        match self {
            NumericTensor::Vector(v) => Ok(v),
            NumericTensor::Matrix(m) => Err(DimensionError::LengthMismatch {
                context: "expected a vector, found a matrix".to_string(),
                expected: 1,
                found: m.first().map_or(0, Vec::len),
            }),
        }
    }

    pub fn into_matrix(self) -> Result<Vec<Vec<f64>>, DimensionError> {
        match self {
            NumericTensor::Matrix(m) => Ok(m),
            NumericTensor::Vector(v) => Ok(vec![v]),
        }
    }
}

fn check_rows<T>(rows: &[Vec<T>]) -> Result<(), DimensionError> {
    if let Some(first) = rows.first() {
        let expected = first.len();
        if let Some((row, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != expected) {
            return Err(DimensionError::RaggedRows {
                row,
                expected,
                found: r.len(),
            });
        }
    }
    Ok(())
}

/// Substitute every symbolic entry at `point`, keeping units.
pub fn substitute_matrix(
    tensor: &SymbolicTensor,
    space: &VariableSpace,
    point: &[f64],
) -> SolverResult<QuantityTensor> {
    match tensor {
        SymbolicTensor::Vector(entries) => Ok(QuantityTensor::Vector(
            entries
                .iter()
                .map(|e| e.substitute(space, point))
                .collect::<SolverResult<_>>()?,
        )),
        SymbolicTensor::Matrix(rows) => {
            check_rows(rows)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(
                    row.iter()
                        .map(|e| e.substitute(space, point))
                        .collect::<SolverResult<Vec<_>>>()?,
                );
            }
            Ok(QuantityTensor::Matrix(out))
        }
    }
}

/// Substitute and strip in one pass, skipping unit bookkeeping.
pub fn evaluate_numeric(
    tensor: &SymbolicTensor,
    space: &VariableSpace,
    point: &[f64],
) -> SolverResult<NumericTensor> {
    match tensor {
        SymbolicTensor::Vector(entries) => Ok(NumericTensor::Vector(
            entries
                .iter()
                .map(|e| e.evaluate(space, point))
                .collect::<SolverResult<_>>()?,
        )),
        SymbolicTensor::Matrix(rows) => {
            check_rows(rows)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(
                    row.iter()
                        .map(|e| e.evaluate(space, point))
                        .collect::<SolverResult<Vec<_>>>()?,
                );
            }
            Ok(NumericTensor::Matrix(out))
        }
    }
}

/// Drop units, keeping magnitudes.
pub fn strip_units(tensor: &QuantityTensor) -> Result<NumericTensor, DimensionError> {
    match tensor {
        QuantityTensor::Vector(v) => Ok(NumericTensor::Vector(
            v.iter().map(|q| q.magnitude).collect(),
        )),
        QuantityTensor::Matrix(rows) => {
            check_rows(rows)?;
            Ok(NumericTensor::Matrix(
                rows.iter()
                    .map(|row| row.iter().map(|q| q.magnitude).collect())
                    .collect(),
            ))
        }
    }
}

// ============================================================================
// Dense helpers
// ============================================================================

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm_2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

pub fn norm_inf(a: &[f64]) -> f64 {
    a.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
}

pub fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

pub fn mat_vec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| dot(row, v)).collect()
}

/// `a + s·b`
pub fn axpy(a: &[f64], s: f64, b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + s * y).collect()
}

pub fn sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

/// `(M + Mᵀ) / 2`
pub fn symmetrize(m: &mut [Vec<f64>]) {
    let n = m.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[i][j] + m[j][i]);
            m[i][j] = avg;
            m[j][i] = avg;
        }
    }
}

/// Solve the square system `A x = b` with a partial-pivoting LU.
///
/// Returns `None` when the system is singular (the factorization produces
/// non-finite entries).
pub fn solve_dense(matrix: &[Vec<f64>], rhs: &[f64]) -> Result<Option<Vec<f64>>, DimensionError> {
    let n = matrix.len();
    if n == 0 {
        return Ok(Some(Vec::new()));
    }
    if rhs.len() != n {
        return Err(DimensionError::LengthMismatch {
            context: "dense solve right-hand side".to_string(),
            expected: n,
            found: rhs.len(),
        });
    }
    check_rows(matrix)?;
    if matrix[0].len() != n {
        return Err(DimensionError::LengthMismatch {
            context: "dense solve requires a square matrix".to_string(),
            expected: n,
            found: matrix[0].len(),
        });
    }

    let mat = Mat::from_fn(n, n, |i, j| matrix[i][j]);
    let rhs_mat = Mat::from_fn(n, 1, |i, _| rhs[i]);
    let lu = PartialPivLu::new(mat.as_ref());
    let sol = lu.solve(&rhs_mat);

    let mut solution = Vec::with_capacity(n);
    for i in 0..n {
        solution.push(sol.read(i, 0));
    }
    if solution.iter().all(|v| v.is_finite()) {
        Ok(Some(solution))
    } else {
        Ok(None)
    }
}
