//! Coarsest-level solvers.
//!
//! Two interchangeable methods close the cycle at the bottom of the
//! hierarchy:
//!
//! * [`CoarsestMethod::SaddlePoint`] factors the full indefinite system
//!   [F C^T; C 0] once with an LDL^T decomposition in natural order, so the
//!   definite functional block eliminates before the multiplier block and no
//!   pivoting is needed.
//! * [`CoarsestMethod::DivFree`] runs pcg on the functional projected into
//!   the divergence-free subspace. It assumes the incoming iterate already
//!   satisfies the constraint, which the cycle maintains.
//!
//! On the topologies this solver targets the divergence-free subspace is
//! exactly the constraint null space, so both variants produce the same
//! correction.

use sprs::FillInReduction;
use sprs_ldl::Ldl;

use crate::error::{Result, SolverError};
use crate::hierarchy::Hierarchy;
use crate::solver::{l1_inverse, pcg};
use crate::utils::{block_matrix, euclidean_norm};
use crate::{Cholesky, CooMatrix, CsrMatrix, Vector};

/// Coarsest-solver selection, part of the solver configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoarsestMethod {
    SaddlePoint,
    DivFree { max_iter: usize, tolerance: f64 },
}

enum Inner {
    SaddlePoint {
        factor: Cholesky,
        n_block: usize,
        /// Constraint rows kept in the factored system; one fewer than the
        /// cell count when the multiplier is pinned.
        n_cons: usize,
    },
    DivFree {
        subspace: CsrMatrix,
        subspace_t: CsrMatrix,
        functional: CsrMatrix,
        l1: Vector,
        max_iter: usize,
        tolerance: f64,
    },
}

pub struct CoarsestSolver {
    inner: Inner,
}

/// Copy of `mat` with only the first `rows` rows, widened to `cols`
/// columns. Widening embeds the Hdiv-only constraint into the full
/// solution block.
fn take_rows(mat: &CsrMatrix, rows: usize, cols: usize) -> CsrMatrix {
    let mut out = CooMatrix::new((rows, cols));
    for (i, row) in mat.outer_iterator().enumerate().take(rows) {
        for (j, val) in row.iter() {
            out.add_triplet(i, j, *val);
        }
    }
    out.to_csr()
}

impl CoarsestSolver {
    pub fn new(hierarchy: &Hierarchy, method: CoarsestMethod) -> Result<Self> {
        let level = hierarchy.coarsest();
        let input = level.input();
        let n_block = level.offsets.total();

        let inner = match method {
            CoarsestMethod::SaddlePoint => {
                // With every boundary face essential the constraint rows sum
                // to zero and one multiplier must be pinned, exactly like an
                // interior patch.
                let pinned = !input
                    .bdr_hdiv
                    .iter()
                    .zip(input.ess_hdiv.iter())
                    .any(|(&bdr, &ess)| bdr && !ess);
                let n_cons = if pinned {
                    input.n_l2 - 1
                } else {
                    input.n_l2
                };

                let constraint = take_rows(&level.constraint, n_cons, n_block);
                let constraint_t = constraint.transpose_view().to_csr();
                let saddle = block_matrix(
                    &[n_block, n_cons],
                    &[n_block, n_cons],
                    &[
                        (0, 0, &level.functional),
                        (1, 0, &constraint),
                        (0, 1, &constraint_t),
                    ],
                );

                let factor = Ldl::new()
                    .check_symmetry(sprs::SymmetryCheck::CheckSymmetry)
                    .fill_in_reduction(FillInReduction::NoReduction)
                    .numeric(saddle.view())
                    .map_err(|e| {
                        SolverError::Configuration(format!(
                            "coarsest saddle-point factorization failed: {e:?}"
                        ))
                    })?;
                Inner::SaddlePoint {
                    factor,
                    n_block,
                    n_cons,
                }
            }
            CoarsestMethod::DivFree {
                max_iter,
                tolerance,
            } => {
                let mut h1_id = CooMatrix::new((input.n_h1, input.n_h1));
                for (v, &flagged) in input.ess_h1.iter().enumerate() {
                    if !flagged {
                        h1_id.add_triplet(v, v, 1.0);
                    }
                }
                let h1_id = h1_id.to_csr();
                let subspace = block_matrix(
                    &[input.n_hdiv, input.n_h1],
                    &[input.n_hcurl, input.n_h1],
                    &[(0, 0, &level.curl), (1, 1, &h1_id)],
                );
                let subspace_t = subspace.transpose_view().to_csr();
                let functional =
                    (&subspace_t * &(&level.functional * &subspace).to_csr()).to_csr();
                let l1 = l1_inverse(&functional);
                Inner::DivFree {
                    subspace,
                    subspace_t,
                    functional,
                    l1,
                    max_iter,
                    tolerance,
                }
            }
        };

        Ok(Self { inner })
    }

    /// Solve the coarsest correction problem: minimize the functional
    /// residual subject to the constraint residual. The multiplier (if any)
    /// stays internal.
    pub fn solve(&self, residual: &Vector, constraint_residual: &Vector) -> Result<Vector> {
        match &self.inner {
            Inner::SaddlePoint {
                factor,
                n_block,
                n_cons,
            } => {
                let mut rhs = Vec::with_capacity(n_block + n_cons);
                rhs.extend(residual.iter());
                rhs.extend(constraint_residual.iter().take(*n_cons));
                let solution = factor.solve(&rhs);
                Ok(Vector::from(solution[..*n_block].to_vec()))
            }
            Inner::DivFree {
                subspace,
                subspace_t,
                functional,
                l1,
                max_iter,
                tolerance,
            } => {
                let g_norm = euclidean_norm(constraint_residual);
                if g_norm > 1e-8 {
                    warn!(
                        "divergence-free coarsest solve ignores a nonzero \
                         constraint residual ({g_norm:.3e})"
                    );
                }
                let b = subspace_t * residual;
                let zeros = Vector::zeros(b.len());
                let mut precond = |r: &mut Vector| *r *= l1;
                let (z, info) = pcg(functional, &b, &zeros, *max_iter, *tolerance, &mut precond);
                if !info.converged {
                    debug!(
                        "coarsest pcg stopped at {} iterations, relative residual {:.3e}",
                        info.iterations,
                        info.relative_residual()
                    );
                }
                Ok(subspace * &z)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{transport_problem, CartesianGrid};
    use crate::utils::{random_vec, zero_masked};

    fn build(ess: [bool; 6]) -> Hierarchy {
        let problem = transport_problem(CartesianGrid::cube(4), 2, ess).unwrap();
        Hierarchy::build(
            problem.functional,
            problem.constraint,
            problem.levels,
            problem.transfers,
        )
        .unwrap()
    }

    #[test]
    fn saddle_point_solve_is_exact() {
        let hierarchy = build([true, false, false, true, false, false]);
        let solver = CoarsestSolver::new(&hierarchy, CoarsestMethod::SaddlePoint).unwrap();
        let level = hierarchy.coarsest();

        let mut r = random_vec(level.offsets.total());
        zero_masked(&mut r, &level.ess_block_mask());
        // Compatible constraint data: the divergence of some free field.
        let mut y = random_vec(level.offsets.n_hdiv);
        zero_masked(&mut y, &level.input().ess_hdiv);
        let g = &level.constraint * &y;

        let x = solver.solve(&r, &g).unwrap();

        let achieved = &level.constraint * &x;
        let err = &achieved - &g;
        assert!(err.iter().all(|v| v.abs() < 1e-8), "constraint missed");

        // Stationarity along the constraint null space.
        let fx = &level.functional * &x;
        let grad = &fx - &r;
        let projected = &level.curl.transpose_view().to_csr() * &grad;
        let scale = 1.0 + euclidean_norm(&grad);
        assert!(
            projected.iter().all(|v| v.abs() < 1e-7 * scale),
            "not a constrained minimizer"
        );
    }

    #[test]
    fn variants_agree_on_divergence_free_correction() {
        let hierarchy = build([false; 6]);
        let saddle = CoarsestSolver::new(&hierarchy, CoarsestMethod::SaddlePoint).unwrap();
        let divfree = CoarsestSolver::new(
            &hierarchy,
            CoarsestMethod::DivFree {
                max_iter: 5000,
                tolerance: 1e-13,
            },
        )
        .unwrap();
        let level = hierarchy.coarsest();

        let r = random_vec(level.offsets.total());
        let g = Vector::zeros(level.input().n_l2);

        let a = saddle.solve(&r, &g).unwrap();
        let b = divfree.solve(&r, &g).unwrap();
        let diff = &a - &b;
        let scale = 1.0 + euclidean_norm(&a);
        assert!(
            diff.iter().all(|v| v.abs() < 1e-7 * scale),
            "variants disagree"
        );
    }

    #[test]
    fn solve_is_deterministic() {
        let hierarchy = build([true, false, false, false, false, false]);
        let solver = CoarsestSolver::new(&hierarchy, CoarsestMethod::SaddlePoint).unwrap();
        let level = hierarchy.coarsest();

        let r = random_vec(level.offsets.total());
        let g = Vector::zeros(level.input().n_l2);
        let a = solver.solve(&r, &g).unwrap();
        let b = solver.solve(&r, &g).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fully_essential_boundary_pins_the_multiplier() {
        let hierarchy = build([true; 6]);
        let solver = CoarsestSolver::new(&hierarchy, CoarsestMethod::SaddlePoint).unwrap();
        let level = hierarchy.coarsest();

        let mut r = random_vec(level.offsets.total());
        zero_masked(&mut r, &level.ess_block_mask());
        let g = Vector::zeros(level.input().n_l2);

        let x = solver.solve(&r, &g).unwrap();
        for (d, &flagged) in level.ess_block_mask().iter().enumerate() {
            if flagged {
                assert!(x[d].abs() < 1e-12, "essential dof {d} moved");
            }
        }
        let achieved = &level.constraint * &x;
        assert!(achieved.iter().all(|v| v.abs() < 1e-8));
    }
}
