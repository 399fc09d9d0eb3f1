//! Krylov and stationary iteration kernels shared by the coarsest-level
//! solver, the particular-solution finder, and the tests.
//!
//! Non-convergence is an expected outcome for these methods, so they report
//! a structured [`SolveInfo`] instead of an error and leave severity to the
//! caller.

use serde::{Deserialize, Serialize};

use crate::{CsrMatrix, Vector};

/// Outcome of an iterative solve: converged flag, iterations used, and the
/// squared-norm history endpoints needed to judge how degraded a
/// non-converged result is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveInfo {
    pub converged: bool,
    pub iterations: usize,
    pub initial_residual: f64,
    pub final_residual: f64,
}

impl SolveInfo {
    pub fn relative_residual(&self) -> f64 {
        if self.initial_residual == 0.0 {
            0.0
        } else {
            self.final_residual / self.initial_residual
        }
    }
}

/// Stationary iterative method based on the preconditioner. Solves the
/// system Ax = b for x where `mat` is A and `rhs` is b. Common
/// preconditioners include the L1 smoother, forward/backward/symmetric
/// Gauss-Seidel, and multilevel methods.
pub fn stationary<F>(
    mat: &CsrMatrix,
    rhs: &Vector,
    initial_iterate: &Vector,
    max_iter: usize,
    epsilon: f64,
    preconditioner: &mut F,
) -> (Vector, SolveInfo)
where
    F: FnMut(&mut Vector),
{
    let mut x = initial_iterate.clone();
    let mut r = rhs - &(mat * &x);
    let r0_norm = r.t().dot(&r);
    let epsilon_squared = epsilon * epsilon;
    let mut r_norm = r0_norm;

    for iter in 0..max_iter {
        r = rhs - &(mat * &x);
        r_norm = r.t().dot(&r);

        if iter % 50 == 0 {
            trace!("squared norm iter {iter}: {r_norm}");
        }

        if r_norm < epsilon_squared * r0_norm {
            info!("stationary converged in {iter} iterations");
            return (
                x,
                SolveInfo {
                    converged: true,
                    iterations: iter,
                    initial_residual: r0_norm.sqrt(),
                    final_residual: r_norm.sqrt(),
                },
            );
        }

        preconditioner(&mut r);
        x += &r;
    }

    (
        x,
        SolveInfo {
            converged: false,
            iterations: max_iter,
            initial_residual: r0_norm.sqrt(),
            final_residual: r_norm.sqrt(),
        },
    )
}

/// Preconditioned conjugate gradient. Solves the system Ax = b for x where
/// `mat` is A and `rhs` is b. The preconditioner is a function that applies
/// the inverse preconditioner to a residual in place.
///
/// The matrix only needs to be s.p.d. on the subspace the Krylov iteration
/// lives in: for a consistent singular system (rhs in the range) the method
/// converges to a least-squares representative, which is all the
/// divergence-free coarse solve needs.
pub fn pcg<F>(
    mat: &CsrMatrix,
    rhs: &Vector,
    initial_iterate: &Vector,
    max_iter: usize,
    epsilon: f64,
    preconditioner: &mut F,
) -> (Vector, SolveInfo)
where
    F: FnMut(&mut Vector),
{
    let mut x = initial_iterate.clone();
    let mut r = rhs - &(mat * &x);
    let mut r_bar = r.clone();
    preconditioner(&mut r_bar);
    let d0 = r.t().dot(&r_bar);
    let mut d = d0;
    let mut p = r_bar.clone();

    if d0 <= 0.0 {
        // Already at the solution (or rhs orthogonal to the range).
        return (
            x,
            SolveInfo {
                converged: true,
                iterations: 0,
                initial_residual: d0.max(0.0).sqrt(),
                final_residual: d0.max(0.0).sqrt(),
            },
        );
    }

    for i in 0..max_iter {
        let mut g = mat * &p;
        let denom = p.t().dot(&g);
        if denom <= 0.0 {
            // Search direction fell into the null space; nothing left to do.
            warn!("pcg hit a zero-curvature direction at iteration {i}");
            return (
                x,
                SolveInfo {
                    converged: false,
                    iterations: i,
                    initial_residual: d0.sqrt(),
                    final_residual: d.sqrt(),
                },
            );
        }
        let alpha = d / denom;
        g *= alpha;
        x += &(alpha * &p);
        r -= &g;
        r_bar = r.clone();
        preconditioner(&mut r_bar);
        let d_old = d;
        d = r.t().dot(&r_bar);

        if i % 50 == 0 {
            trace!("squared norm iter {i}: {d}");
        }

        if d < epsilon * epsilon * d0 {
            info!("pcg converged in {i} iterations");
            return (
                x,
                SolveInfo {
                    converged: true,
                    iterations: i,
                    initial_residual: d0.sqrt(),
                    final_residual: d.sqrt(),
                },
            );
        }

        let beta = d / d_old;
        p *= beta;
        p += &r_bar;
    }

    (
        x,
        SolveInfo {
            converged: false,
            iterations: max_iter,
            initial_residual: d0.sqrt(),
            final_residual: d.sqrt(),
        },
    )
}

/// Inverse of the l1 smoother diagonal: 1 / sum_j |a_ij|. The workhorse
/// preconditioner for the inner pcg solves.
pub fn l1_inverse(mat: &CsrMatrix) -> Vector {
    mat.outer_iterator()
        .map(|row| {
            let row_sum_abs: f64 = row.iter().map(|(_, val)| val.abs()).sum();
            if row_sum_abs > 0.0 {
                1.0 / row_sum_abs
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vector;
    use sprs::TriMat;

    fn laplacian_1d(n: usize) -> CsrMatrix {
        let mut m = TriMat::new((n, n));
        for i in 0..n {
            m.add_triplet(i, i, 2.0);
            if i > 0 {
                m.add_triplet(i, i - 1, -1.0);
            }
            if i + 1 < n {
                m.add_triplet(i, i + 1, -1.0);
            }
        }
        m.to_csr()
    }

    #[test]
    fn pcg_solves_laplacian() {
        let n = 50;
        let mat = laplacian_1d(n);
        let exact = crate::utils::random_vec(n);
        let rhs = &mat * &exact;
        let l1 = l1_inverse(&mat);
        let mut precond = |r: &mut Vector| *r *= &l1;

        let (x, info) = pcg(&mat, &rhs, &Vector::zeros(n), 500, 1e-12, &mut precond);
        assert!(info.converged, "pcg stalled: {:?}", info);
        let err = &x - &exact;
        assert!(err.t().dot(&err).sqrt() < 1e-8);
    }

    #[test]
    fn stationary_reports_non_convergence() {
        let n = 100;
        let mat = laplacian_1d(n);
        let rhs = Vector::from(vec![1.0; n]);
        let l1 = l1_inverse(&mat);
        let mut precond = |r: &mut Vector| *r *= &l1;

        // Far too few iterations for a Laplacian this size.
        let (_, info) = stationary(&mat, &rhs, &Vector::zeros(n), 3, 1e-12, &mut precond);
        assert!(!info.converged);
        assert_eq!(info.iterations, 3);
        assert!(info.final_residual > 0.0);
    }
}
