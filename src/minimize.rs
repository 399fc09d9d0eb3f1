//! Multilevel driver for the constrained minimization problem.
//!
//! [`MinimizationSolver`] runs a stationary V-cycle iteration: on every
//! level the divergence-free subspace smoother and the patch solver see the
//! same residual and their corrections are summed, then a coarse-grid
//! correction passes through the boundary-modified block transfer, and the
//! summed correction is applied again on the way back up. Residuals are
//! updated between the level correction and the coarse correction, so the
//! cycle stays symmetric.
//!
//! The constraint is satisfied once at setup (through a particular
//! solution) and preserved by every correction afterwards. The driver still
//! measures the constraint residual each iteration: by default drift beyond
//! tolerance is logged, in strict mode it aborts the solve.

use crate::assembly::particular_solution;
use crate::coarse::{CoarsestMethod, CoarsestSolver};
use crate::error::{Result, SolverError};
use crate::hierarchy::Hierarchy;
use crate::local::{FactorizationMode, LocalSolver};
use crate::parallel_ops::residual;
use crate::smoother::DivFreeSmoother;
use crate::solver::SolveInfo;
use crate::utils::euclidean_norm;
use crate::Vector;

fn default_sweeps(_level: usize) -> usize {
    2
}

/// When to declare the iteration finished or broken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopCriteria {
    /// Converge on the projected residual norm alone; constraint drift is
    /// only logged.
    ResidualNorm,
    /// Additionally abort with [`SolverError::ConstraintViolation`] when the
    /// relative constraint residual exceeds the given tolerance.
    ConstraintAndResidual { constraint_tolerance: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    pub max_iter: usize,
    pub tolerance: f64,
    /// Apply the patch solver on each level. When both components are on,
    /// their corrections are summed additively before the residual update.
    pub use_local_solver: bool,
    /// Apply the divergence-free subspace smoother on each level.
    pub use_smoother: bool,
    /// Smoothing sweeps per level; coarser levels are cheap, so schedules
    /// that grow with depth cost little.
    pub sweeps: fn(usize) -> usize,
    pub factorization: FactorizationMode,
    pub coarsest: CoarsestMethod,
    pub stop: StopCriteria,
    /// Iteration budget and tolerance for the particular-solution solve at
    /// setup, when no feasible initial iterate is supplied.
    pub setup_max_iter: usize,
    pub setup_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tolerance: 1e-8,
            use_local_solver: true,
            use_smoother: true,
            sweeps: default_sweeps,
            factorization: FactorizationMode::Cached,
            coarsest: CoarsestMethod::SaddlePoint,
            stop: StopCriteria::ResidualNorm,
            setup_max_iter: 2000,
            setup_tolerance: 1e-12,
        }
    }
}

pub struct MinimizationSolver<'a> {
    hierarchy: &'a Hierarchy,
    config: SolverConfig,
    smoothers: Vec<DivFreeSmoother>,
    locals: Vec<LocalSolver>,
    coarsest: CoarsestSolver,
}

impl<'a> MinimizationSolver<'a> {
    pub fn new(hierarchy: &'a Hierarchy, config: SolverConfig) -> Result<Self> {
        let depth = hierarchy.num_levels() - 1;
        let mut smoothers = Vec::with_capacity(depth);
        let mut locals = Vec::with_capacity(depth);
        for level in 0..depth {
            smoothers.push(DivFreeSmoother::new(
                hierarchy,
                level,
                (config.sweeps)(level),
            )?);
            locals.push(LocalSolver::new(hierarchy, level, config.factorization)?);
        }
        let coarsest = CoarsestSolver::new(hierarchy, config.coarsest)?;
        Ok(Self {
            hierarchy,
            config,
            smoothers,
            locals,
            coarsest,
        })
    }

    /// Constraint applied to the Hdiv part of a block vector.
    fn constraint_apply(&self, level: usize, x: &Vector) -> Result<Vector> {
        let lvl = self.hierarchy.level(level)?;
        let hdiv = x.slice(ndarray::s![lvl.offsets.hdiv_range()]).to_owned();
        Ok(&lvl.constraint * &hdiv)
    }

    /// Additive combination of the configured per-level components: the
    /// subspace smoother and the patch solver see the same residual and
    /// their corrections are summed.
    fn level_correction(&self, level: usize, r: &Vector, g: &Vector) -> Result<Vector> {
        let mut c = Vector::zeros(r.len());
        if self.config.use_smoother {
            c += &self.smoothers[level].apply(r);
        }
        if self.config.use_local_solver {
            c += &self.locals[level].apply(r, g)?;
        }
        Ok(c)
    }

    /// One V-cycle correction for the block residual `r` and constraint
    /// residual `g` on `level`. Every correction it returns keeps essential
    /// dofs at zero.
    fn cycle(&self, level: usize, r: &Vector, g: &Vector) -> Result<Vector> {
        if level + 1 == self.hierarchy.num_levels() {
            return self.coarsest.solve(r, g);
        }
        let lvl = self.hierarchy.level(level)?;

        let mut x = self.level_correction(level, r, g)?;
        let mut r_cur = residual(&lvl.functional, &x, r);
        let mut g_cur = g - &self.constraint_apply(level, &x)?;

        // Coarse correction through the boundary-modified block transfer;
        // constraint data is aggregated through the L2 restriction.
        let transfer = self.hierarchy.transfer(level)?;
        let r_coarse = &transfer.restriction * &r_cur;
        let g_coarse = &transfer.l2_restriction * &g_cur;
        let x_coarse = self.cycle(level + 1, &r_coarse, &g_coarse)?;
        x += &(&transfer.block * &x_coarse);
        r_cur = residual(&lvl.functional, &x, r);
        g_cur = g - &self.constraint_apply(level, &x)?;

        x += &self.level_correction(level, &r_cur, &g_cur)?;
        Ok(x)
    }

    /// Minimize the functional subject to the divergence constraint:
    /// find x with C x = `constraint_rhs` minimizing
    /// 1/2 x^T F x - `rhs`^T x. When `initial` is given it must already be
    /// feasible; otherwise a particular solution is computed at setup.
    pub fn solve(
        &self,
        rhs: &Vector,
        constraint_rhs: &Vector,
        initial: Option<Vector>,
    ) -> Result<(Vector, SolveInfo)> {
        let finest = self.hierarchy.finest();
        if rhs.len() != finest.offsets.total() {
            return Err(SolverError::Configuration(format!(
                "rhs has {} entries, expected {}",
                rhs.len(),
                finest.offsets.total()
            )));
        }
        if constraint_rhs.len() != finest.input().n_l2 {
            return Err(SolverError::Configuration(format!(
                "constraint rhs has {} entries, expected {}",
                constraint_rhs.len(),
                finest.input().n_l2
            )));
        }

        let mut x = match initial {
            Some(x) => {
                if x.len() != finest.offsets.total() {
                    return Err(SolverError::Configuration(
                        "initial iterate has the wrong length".into(),
                    ));
                }
                x
            }
            None => {
                let (hdiv_part, info) = particular_solution(
                    &finest.constraint,
                    constraint_rhs,
                    self.config.setup_max_iter,
                    self.config.setup_tolerance,
                );
                debug!(
                    "particular solution in {} iterations, relative residual {:.3e}",
                    info.iterations,
                    info.relative_residual()
                );
                let mut x = Vector::zeros(finest.offsets.total());
                x.slice_mut(ndarray::s![finest.offsets.hdiv_range()])
                    .assign(&hdiv_part);
                x
            }
        };

        let g_scale = 1.0 + euclidean_norm(constraint_rhs);
        let measure = match self.smoothers.first() {
            Some(s) => s,
            // Single-level hierarchy: the coarse solve below is exact, the
            // projection is only used for reporting.
            None => return self.single_level_solve(x, rhs, constraint_rhs),
        };

        let mut r = residual(&finest.functional, &x, rhs);
        let r0_norm = euclidean_norm(&measure.projected_residual(&r));
        let mut r_norm = r0_norm;

        for iter in 0..self.config.max_iter {
            let g_res = constraint_rhs - &self.constraint_apply(0, &x)?;
            let violation = euclidean_norm(&g_res) / g_scale;
            if let StopCriteria::ConstraintAndResidual {
                constraint_tolerance,
            } = self.config.stop
            {
                if violation > constraint_tolerance {
                    return Err(SolverError::ConstraintViolation {
                        residual: violation,
                        tolerance: constraint_tolerance,
                    });
                }
            } else if violation > 1e-6 {
                warn!("constraint drift at iteration {iter}: {violation:.3e}");
            }

            r = residual(&finest.functional, &x, rhs);
            r_norm = euclidean_norm(&measure.projected_residual(&r));
            debug!("iteration {iter}: projected residual {r_norm:.6e}, constraint {violation:.3e}");

            if r_norm <= self.config.tolerance * r0_norm {
                info!("converged in {iter} iterations");
                return Ok((
                    x,
                    SolveInfo {
                        converged: true,
                        iterations: iter,
                        initial_residual: r0_norm,
                        final_residual: r_norm,
                    },
                ));
            }

            let dx = self.cycle(0, &r, &g_res)?;
            x += &dx;
        }

        Ok((
            x,
            SolveInfo {
                converged: false,
                iterations: self.config.max_iter,
                initial_residual: r0_norm,
                final_residual: r_norm,
            },
        ))
    }

    fn single_level_solve(
        &self,
        mut x: Vector,
        rhs: &Vector,
        constraint_rhs: &Vector,
    ) -> Result<(Vector, SolveInfo)> {
        let finest = self.hierarchy.finest();
        let r = rhs - &(&finest.functional * &x);
        let g_res = constraint_rhs - &self.constraint_apply(0, &x)?;
        let r0_norm = euclidean_norm(&r);
        x += &self.coarsest.solve(&r, &g_res)?;
        let r_final = rhs - &(&finest.functional * &x);
        Ok((
            x,
            SolveInfo {
                converged: true,
                iterations: 1,
                initial_residual: r0_norm,
                final_residual: euclidean_norm(&r_final),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{heat_problem, transport_problem, CartesianGrid, Problem};
    use crate::utils::{random_vec, zero_masked};

    fn hierarchy_from(problem: Problem) -> Hierarchy {
        Hierarchy::build(
            problem.functional,
            problem.constraint,
            problem.levels,
            problem.transfers,
        )
        .unwrap()
    }

    /// Feasible exact solution: a divergence-free part plus a particular
    /// solution for random compatible constraint data.
    fn manufactured(hierarchy: &Hierarchy) -> (Vector, Vector, Vector) {
        let finest = hierarchy.finest();
        let y = random_vec(finest.input().n_hcurl);
        let div_free = &finest.curl * &y;

        let mut seed = random_vec(finest.offsets.n_hdiv);
        zero_masked(&mut seed, &finest.input().ess_hdiv);
        let g = &finest.constraint * &seed;
        let (particular, info) =
            crate::assembly::particular_solution(&finest.constraint, &g, 5000, 1e-13);
        assert!(info.converged);

        let mut x_exact = Vector::zeros(finest.offsets.total());
        {
            let mut hdiv = x_exact.slice_mut(ndarray::s![finest.offsets.hdiv_range()]);
            hdiv += &div_free;
            hdiv += &particular;
        }
        if finest.offsets.n_h1 > 0 {
            let mut s = random_vec(finest.offsets.n_h1);
            zero_masked(&mut s, &finest.input().ess_h1);
            x_exact
                .slice_mut(ndarray::s![finest.offsets.h1_range()])
                .assign(&s);
        }

        let rhs = &finest.functional * &x_exact;
        (x_exact, rhs, g)
    }

    #[test]
    fn converges_on_transport_problem() {
        let ess = [true, false, true, false, false, true];
        let hierarchy =
            hierarchy_from(transport_problem(CartesianGrid::cube(4), 2, ess).unwrap());
        let (x_exact, rhs, g) = manufactured(&hierarchy);

        let config = SolverConfig {
            tolerance: 1e-10,
            max_iter: 200,
            ..SolverConfig::default()
        };
        let solver = MinimizationSolver::new(&hierarchy, config).unwrap();
        let (x, info) = solver.solve(&rhs, &g, None).unwrap();
        assert!(info.converged, "stalled: {info:?}");

        let err = &x - &x_exact;
        let rel = euclidean_norm(&err) / euclidean_norm(&x_exact);
        assert!(rel < 1e-5, "relative error {rel}");
    }

    #[test]
    fn converges_with_divfree_coarsest() {
        let hierarchy =
            hierarchy_from(transport_problem(CartesianGrid::cube(4), 2, [false; 6]).unwrap());
        let (x_exact, rhs, g) = manufactured(&hierarchy);

        let config = SolverConfig {
            tolerance: 1e-10,
            max_iter: 200,
            coarsest: CoarsestMethod::DivFree {
                max_iter: 5000,
                tolerance: 1e-12,
            },
            ..SolverConfig::default()
        };
        let solver = MinimizationSolver::new(&hierarchy, config).unwrap();
        let (x, info) = solver.solve(&rhs, &g, None).unwrap();
        assert!(info.converged, "stalled: {info:?}");
        let err = &x - &x_exact;
        assert!(euclidean_norm(&err) / euclidean_norm(&x_exact) < 1e-5);
    }

    #[test]
    fn constraint_is_preserved_across_iterations() {
        let ess = [true, true, false, false, true, false];
        let hierarchy =
            hierarchy_from(transport_problem(CartesianGrid::cube(4), 2, ess).unwrap());
        let (_, rhs, g) = manufactured(&hierarchy);

        // Run a handful of cycles well short of convergence.
        let config = SolverConfig {
            max_iter: 5,
            tolerance: 1e-15,
            ..SolverConfig::default()
        };
        let solver = MinimizationSolver::new(&hierarchy, config).unwrap();
        let (x, info) = solver.solve(&rhs, &g, None).unwrap();
        assert!(!info.converged);

        let finest = hierarchy.finest();
        let achieved =
            &finest.constraint * &x.slice(ndarray::s![finest.offsets.hdiv_range()]).to_owned();
        let drift = &achieved - &g;
        let rel = euclidean_norm(&drift) / (1.0 + euclidean_norm(&g));
        assert!(rel < 1e-10, "constraint drift {rel}");

        for (d, &flagged) in finest.ess_block_mask().iter().enumerate() {
            if flagged {
                assert!(x[d].abs() < 1e-10, "essential dof {d} moved");
            }
        }
    }

    #[test]
    fn strict_mode_rejects_infeasible_initial_iterate() {
        let hierarchy =
            hierarchy_from(transport_problem(CartesianGrid::cube(4), 2, [false; 6]).unwrap());
        let (_, rhs, g) = manufactured(&hierarchy);

        let config = SolverConfig {
            stop: StopCriteria::ConstraintAndResidual {
                constraint_tolerance: 1e-8,
            },
            ..SolverConfig::default()
        };
        let solver = MinimizationSolver::new(&hierarchy, config).unwrap();

        let bad = random_vec(hierarchy.finest().offsets.total());
        let err = solver.solve(&rhs, &g, Some(bad));
        assert!(matches!(err, Err(SolverError::ConstraintViolation { .. })));
    }

    #[test]
    fn converges_on_heat_problem() {
        let hierarchy = hierarchy_from(
            heat_problem(CartesianGrid::cube(4), 2, [false; 6], [true; 6]).unwrap(),
        );
        let (x_exact, rhs, g) = manufactured(&hierarchy);

        let config = SolverConfig {
            tolerance: 1e-10,
            max_iter: 300,
            ..SolverConfig::default()
        };
        let solver = MinimizationSolver::new(&hierarchy, config).unwrap();
        let (x, info) = solver.solve(&rhs, &g, None).unwrap();
        assert!(info.converged, "stalled: {info:?}");
        let err = &x - &x_exact;
        assert!(euclidean_norm(&err) / euclidean_norm(&x_exact) < 1e-5);
    }

    #[test]
    fn rejects_mismatched_rhs() {
        let hierarchy =
            hierarchy_from(transport_problem(CartesianGrid::cube(4), 2, [false; 6]).unwrap());
        let solver = MinimizationSolver::new(&hierarchy, SolverConfig::default()).unwrap();
        let rhs = Vector::zeros(3);
        let g = Vector::zeros(hierarchy.finest().input().n_l2);
        assert!(matches!(
            solver.solve(&rhs, &g, None),
            Err(SolverError::Configuration(_))
        ));
    }
}
