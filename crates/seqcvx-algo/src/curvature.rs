//! Quasi-Newton curvature updates.
//!
//! Two secant updates maintain curvature information between iterations:
//!
//! - [`damped_bfgs_update`]: Powell's damped BFGS for the Lagrangian Hessian.
//!   The damping blends `y` toward `B s` whenever `sᵀy` is too small, which
//!   keeps the matrix positive definite even for `sᵀy < 0`.
//! - [`sr1_update`]: symmetric rank-one, for the local models of runtime
//!   outputs. SR1 may produce indefinite matrices, which is what a local model
//!   of a non-convex black-box output needs. Near-singular updates are skipped.
//!
//! Both functions return a new matrix; the input is left untouched.

use crate::linalg::{dot, mat_vec, norm_2, sub, symmetrize};

/// Whether an update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The update was skipped; the matrix is unchanged.
    Skipped,
}

/// Powell-damped BFGS update.
///
/// ```text
/// θ = 1                           if sᵀy ≥ ζ·sᵀBs
/// θ = (1−ζ)·sᵀBs / (sᵀBs − sᵀy)   otherwise
/// r = θ·y + (1−θ)·Bs
/// B⁺ = B − (Bs)(Bs)ᵀ/sᵀBs + r rᵀ/sᵀr
/// ```
///
/// With the usual `ζ = 0.2` this is the classical `0.8·sᵀBs/(sᵀBs − sᵀy)`.
/// A zero step (or a degenerate `B`) leaves `B` unchanged.
pub fn damped_bfgs_update(
    b: &[Vec<f64>],
    s: &[f64],
    y: &[f64],
    zeta: f64,
) -> (Vec<Vec<f64>>, UpdateOutcome) {
    let bs = mat_vec(b, s);
    let s_bs = dot(s, &bs);
    let s_y = dot(s, y);

    if !(s_bs > f64::EPSILON * dot(s, s).max(f64::MIN_POSITIVE)) || !s_bs.is_finite() {
        return (b.to_vec(), UpdateOutcome::Skipped);
    }

    let theta = if s_y >= zeta * s_bs {
        1.0
    } else {
        (1.0 - zeta) * s_bs / (s_bs - s_y)
    };
    let r: Vec<f64> = y
        .iter()
        .zip(&bs)
        .map(|(yi, bsi)| theta * yi + (1.0 - theta) * bsi)
        .collect();
    let s_r = dot(s, &r);
    if !(s_r > 0.0) || !s_r.is_finite() {
        return (b.to_vec(), UpdateOutcome::Skipped);
    }

    let n = b.len();
    let mut next = b.to_vec();
    for i in 0..n {
        for j in 0..n {
            next[i][j] += -bs[i] * bs[j] / s_bs + r[i] * r[j] / s_r;
        }
    }
    symmetrize(&mut next);
    (next, UpdateOutcome::Applied)
}

/// Symmetric rank-one update with the standard skip safeguard.
///
/// ```text
/// v  = y − B s
/// B⁺ = B + v vᵀ / (sᵀv)      unless |sᵀv| < r·‖s‖·‖v‖
/// ```
pub fn sr1_update(b: &[Vec<f64>], s: &[f64], y: &[f64], r: f64) -> (Vec<Vec<f64>>, UpdateOutcome) {
    let v = sub(y, &mat_vec(b, s));
    let s_v = dot(s, &v);
    let threshold = r * norm_2(s) * norm_2(&v);
    if !(s_v.abs() >= threshold) || s_v == 0.0 || !s_v.is_finite() {
        return (b.to_vec(), UpdateOutcome::Skipped);
    }

    let n = b.len();
    let mut next = b.to_vec();
    for i in 0..n {
        for j in 0..n {
            next[i][j] += v[i] * v[j] / s_v;
        }
    }
    symmetrize(&mut next);
    (next, UpdateOutcome::Applied)
}
