//! Divergence-free subspace smoother.
//!
//! Corrections are sought in the range of the boundary-aware curl (plus the
//! free part of the auxiliary scalar block), so they cannot perturb the
//! divergence constraint at all: applying the constraint to any output of
//! this smoother gives exact zeros, not small ones.
//!
//! The smoother projects the residual into the subspace, runs a fixed
//! number of symmetric Gauss-Seidel sweeps on the projected functional from
//! a zero initial guess, and lifts the result back. Starting from zero and
//! sweeping forward then backward keeps the correction operator symmetric
//! for any sweep count, which the outer minimization relies on.

use crate::error::Result;
use crate::hierarchy::Hierarchy;
use crate::utils::{block_matrix, diagonal};
use crate::{CooMatrix, CsrMatrix, Vector};

pub struct DivFreeSmoother {
    /// Subspace map from [Hcurl; H1] parameters into the solution block.
    subspace: CsrMatrix,
    subspace_t: CsrMatrix,
    /// Projected functional over the subspace parameters.
    functional: CsrMatrix,
    diag: Vector,
    sweeps: usize,
}

impl DivFreeSmoother {
    pub fn new(hierarchy: &Hierarchy, level: usize, sweeps: usize) -> Result<Self> {
        let lvl = hierarchy.level(level)?;
        let input = lvl.input();

        // Identity on the free scalar dofs; essential ones stay out of the
        // subspace entirely.
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
            &[(0, 0, &lvl.curl), (1, 1, &h1_id)],
        );
        let subspace_t = subspace.transpose_view().to_csr();
        let functional = (&subspace_t * &(&lvl.functional * &subspace).to_csr()).to_csr();
        let diag = diagonal(&functional);

        Ok(Self {
            subspace,
            subspace_t,
            functional,
            diag,
            sweeps,
        })
    }

    fn gauss_seidel_pass<I>(&self, z: &mut Vector, b: &Vector, order: I)
    where
        I: Iterator<Item = usize>,
    {
        for i in order {
            let d = self.diag[i];
            // Zero diagonal marks a parameter outside the subspace
            // (essential edge); it never moves.
            if d == 0.0 {
                continue;
            }
            let row = self.functional.outer_view(i).unwrap();
            let mut sum = b[i];
            for (j, val) in row.iter() {
                if j != i {
                    sum -= val * z[j];
                }
            }
            z[i] = sum / d;
        }
    }

    /// Residual projected into the subspace parameters. The constrained
    /// minimizer is exactly the point where this projection vanishes, which
    /// makes it the natural convergence measure for the outer iteration.
    pub fn projected_residual(&self, residual: &Vector) -> Vector {
        &self.subspace_t * residual
    }

    /// Smoothed correction for a block residual. The output lies in the
    /// divergence-free, boundary-conforming subspace by construction.
    pub fn apply(&self, residual: &Vector) -> Vector {
        let b = &self.subspace_t * residual;
        let n = b.len();
        let mut z = Vector::zeros(n);
        for _ in 0..self.sweeps {
            self.gauss_seidel_pass(&mut z, &b, 0..n);
            self.gauss_seidel_pass(&mut z, &b, (0..n).rev());
        }
        &self.subspace * &z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{heat_problem, transport_problem, CartesianGrid};
    use crate::utils::random_vec;

    fn transport_hierarchy(ess: [bool; 6]) -> Hierarchy {
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
    fn corrections_are_divergence_free() {
        let hierarchy = transport_hierarchy([true, false, true, false, false, false]);
        let smoother = DivFreeSmoother::new(&hierarchy, 0, 2).unwrap();
        let level = hierarchy.level(0).unwrap();

        let r = random_vec(level.offsets.total());
        let correction = smoother.apply(&r);
        let violation = &level.constraint * &correction;
        assert!(
            violation.iter().all(|v| v.abs() < 1e-12),
            "smoother left the constraint manifold"
        );
    }

    #[test]
    fn corrections_vanish_on_essential_boundary() {
        let ess = [true, true, false, false, true, true];
        let hierarchy = transport_hierarchy(ess);
        let smoother = DivFreeSmoother::new(&hierarchy, 0, 3).unwrap();
        let level = hierarchy.level(0).unwrap();

        let r = random_vec(level.offsets.total());
        let correction = smoother.apply(&r);
        for (d, &flagged) in level.ess_block_mask().iter().enumerate() {
            if flagged {
                assert_eq!(correction[d], 0.0, "dof {d} moved");
            }
        }
    }

    #[test]
    fn correction_operator_is_symmetric() {
        let hierarchy = transport_hierarchy([true; 6]);
        for sweeps in [1, 3] {
            let smoother = DivFreeSmoother::new(&hierarchy, 0, sweeps).unwrap();
            let n = hierarchy.level(0).unwrap().offsets.total();
            let u = random_vec(n);
            let v = random_vec(n);
            let tu = smoother.apply(&u);
            let tv = smoother.apply(&v);
            let left = u.t().dot(&tv);
            let right = v.t().dot(&tu);
            assert!(
                (left - right).abs() < 1e-10 * (1.0 + left.abs()),
                "asymmetry with {sweeps} sweeps: {left} vs {right}"
            );
        }
    }

    #[test]
    fn scalar_block_participates() {
        let problem = heat_problem(CartesianGrid::cube(4), 2, [false; 6], [true; 6]).unwrap();
        let hierarchy = Hierarchy::build(
            problem.functional,
            problem.constraint,
            problem.levels,
            problem.transfers,
        )
        .unwrap();
        let smoother = DivFreeSmoother::new(&hierarchy, 0, 2).unwrap();
        let level = hierarchy.level(0).unwrap();

        let r = random_vec(level.offsets.total());
        let correction = smoother.apply(&r);
        let h1_part = correction.slice(ndarray::s![level.offsets.h1_range()]);
        assert!(h1_part.iter().any(|v| v.abs() > 0.0));
        let violation = &level.constraint * &correction.slice(ndarray::s![level.offsets.hdiv_range()]).to_owned();
        assert!(violation.iter().all(|v| v.abs() < 1e-12));
    }
}
