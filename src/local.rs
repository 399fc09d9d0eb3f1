//! Additive Schwarz patch solver over agglomerates.
//!
//! Each agglomerate of fine cells induces a patch: the solution dofs whose
//! every containing element lies inside that agglomerate, minus essential
//! dofs. Patches are therefore disjoint, so the additive combination of the
//! patch corrections is independent of traversal order down to the last bit.
//!
//! Every patch solves a dense saddle-point system coupling the functional
//! restricted to the patch with the divergence constraint on the
//! agglomerate's cells. A patch whose faces are all interior carries a
//! one-dimensional multiplier null space (constants); the last multiplier is
//! pinned there and the dropped row holds automatically whenever the local
//! constraint data is compatible.

use std::collections::HashMap;

use indexmap::IndexMap;
use ndarray_linalg::{FactorizeInto, LUFactorized, Solve};
use ndarray::OwnedRepr;
use rayon::prelude::*;

use crate::error::{Result, SolverError};
use crate::hierarchy::{Hierarchy, Level, SpaceKind, Transfer};
use crate::{Matrix, Vector};

/// When to run the dense factorizations.
///
/// `Cached` pays the factorization cost once at setup, the right choice
/// inside an iterative cycle. `Fresh` refactorizes on every application and
/// keeps no factor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorizationMode {
    Cached,
    Fresh,
}

struct Patch {
    /// Global block indices of the patch solution dofs, Hdiv then H1.
    block_dofs: Vec<usize>,
    /// Fine cells of the agglomerate; the local constraint rows.
    cells: Vec<usize>,
    /// True when the patch sees no natural-boundary face and the last
    /// multiplier is pinned.
    pinned: bool,
    /// Dense saddle-point matrix [F D^T; D 0], multiplier block trimmed
    /// when pinned.
    matrix: Matrix,
}

impl Patch {
    fn num_constraints(&self) -> usize {
        if self.pinned {
            self.cells.len() - 1
        } else {
            self.cells.len()
        }
    }

    fn rhs(&self, residual: &Vector, constraint_residual: &Vector) -> Vector {
        let np = self.block_dofs.len();
        let nc = self.num_constraints();
        let mut rhs = Vector::zeros(np + nc);
        for (li, &gi) in self.block_dofs.iter().enumerate() {
            rhs[li] = residual[gi];
        }
        for (lc, &cell) in self.cells.iter().take(nc).enumerate() {
            rhs[np + lc] = constraint_residual[cell];
        }
        if self.pinned {
            // Pinning is only exact when the local constraint data sums to
            // zero over the agglomerate (uniform cells).
            debug_assert!(
                self.cells
                    .iter()
                    .map(|&c| constraint_residual[c])
                    .sum::<f64>()
                    .abs()
                    < 1e-8 * (1.0 + constraint_residual.iter().map(|v| v.abs()).sum::<f64>()),
                "incompatible local constraint on a pinned patch"
            );
        }
        rhs
    }

    fn scatter(&self, solution: &Vector, out: &mut Vector) {
        for (li, &gi) in self.block_dofs.iter().enumerate() {
            out[gi] += solution[li];
        }
    }
}

/// Additive Schwarz solver for one level of the hierarchy.
pub struct LocalSolver {
    level: usize,
    mode: FactorizationMode,
    patches: Vec<Patch>,
    factors: Vec<LUFactorized<OwnedRepr<f64>>>,
}

fn factorize(patch: &Patch, level: usize, idx: usize) -> Result<LUFactorized<OwnedRepr<f64>>> {
    patch
        .matrix
        .clone()
        .factorize_into()
        .map_err(|_| SolverError::SingularLocalSystem { level, patch: idx })
}

fn build_patches(level: &Level, transfer: &Transfer) -> Vec<Patch> {
    let input = level.input();
    let n_hdiv = level.offsets.n_hdiv;
    let hdiv_map = level.true_dofs(SpaceKind::Hdiv);
    let h1_map = level.true_dofs(SpaceKind::H1);
    let agglomeration = &transfer.agglomeration;

    // Number of elements touching each dof, to recognize dofs exclusive to
    // one agglomerate.
    let mut hdiv_touch = vec![0usize; input.n_hdiv];
    for faces in &input.elem_to_hdiv {
        for &f in faces {
            hdiv_touch[hdiv_map.to_true(f)] += 1;
        }
    }
    let mut h1_touch = vec![0usize; input.n_h1];
    for verts in &input.elem_to_h1 {
        for &v in verts {
            h1_touch[h1_map.to_true(v)] += 1;
        }
    }

    let mut patches = Vec::with_capacity(agglomeration.num_aggs());
    for agg in 0..agglomeration.num_aggs() {
        let cells = agglomeration.cells_of(agg).to_vec();

        // Insertion-ordered so patch layout is deterministic.
        let mut hdiv_count: IndexMap<usize, usize> = IndexMap::new();
        let mut h1_count: IndexMap<usize, usize> = IndexMap::new();
        for &cell in &cells {
            for &f in &input.elem_to_hdiv[cell] {
                *hdiv_count.entry(hdiv_map.to_true(f)).or_insert(0) += 1;
            }
            if !input.elem_to_h1.is_empty() {
                for &v in &input.elem_to_h1[cell] {
                    *h1_count.entry(h1_map.to_true(v)).or_insert(0) += 1;
                }
            }
        }

        let mut hdiv_dofs: Vec<usize> = hdiv_count
            .iter()
            .filter(|&(&d, &cnt)| cnt == hdiv_touch[d] && !input.ess_hdiv[d])
            .map(|(&d, _)| d)
            .collect();
        hdiv_dofs.sort_unstable();
        let mut h1_dofs: Vec<usize> = h1_count
            .iter()
            .filter(|&(&d, &cnt)| cnt == h1_touch[d] && !input.ess_h1[d])
            .map(|(&d, _)| d)
            .collect();
        h1_dofs.sort_unstable();

        if hdiv_dofs.is_empty() && h1_dofs.is_empty() {
            continue;
        }

        let pinned = !hdiv_dofs.iter().any(|&d| input.bdr_hdiv[d]);

        let mut block_dofs: Vec<usize> = hdiv_dofs.clone();
        block_dofs.extend(h1_dofs.iter().map(|&v| n_hdiv + v));

        let index_of: HashMap<usize, usize> = block_dofs
            .iter()
            .enumerate()
            .map(|(li, &gi)| (gi, li))
            .collect();

        let np = block_dofs.len();
        let nc = if pinned { cells.len() - 1 } else { cells.len() };
        let mut matrix = Matrix::zeros((np + nc, np + nc));

        for (li, &gi) in block_dofs.iter().enumerate() {
            let row = level.functional.outer_view(gi).unwrap();
            for (gj, val) in row.iter() {
                if let Some(&lj) = index_of.get(&gj) {
                    matrix[[li, lj]] = *val;
                }
            }
        }
        for (lc, &cell) in cells.iter().take(nc).enumerate() {
            let row = level.constraint.outer_view(cell).unwrap();
            for (gj, val) in row.iter() {
                if let Some(&lj) = index_of.get(&gj) {
                    matrix[[np + lc, lj]] = *val;
                    matrix[[lj, np + lc]] = *val;
                }
            }
        }

        patches.push(Patch {
            block_dofs,
            cells,
            pinned,
            matrix,
        });
    }
    patches
}

impl LocalSolver {
    /// Build the patch solver for `level` of the hierarchy. The agglomerates
    /// come from the transfer below that level, so the coarsest level has no
    /// local solver.
    pub fn new(hierarchy: &Hierarchy, level: usize, mode: FactorizationMode) -> Result<Self> {
        let lvl = hierarchy.level(level)?;
        let transfer = hierarchy.transfer(level)?;
        let patches = build_patches(lvl, transfer);

        let factors = match mode {
            FactorizationMode::Cached => patches
                .par_iter()
                .enumerate()
                .map(|(idx, p)| factorize(p, level, idx))
                .collect::<Result<Vec<_>>>()?,
            FactorizationMode::Fresh => Vec::new(),
        };

        debug!(
            "level {level}: {} patches, factorization {:?}",
            patches.len(),
            mode
        );
        Ok(Self {
            level,
            mode,
            patches,
            factors,
        })
    }

    pub fn num_patches(&self) -> usize {
        self.patches.len()
    }

    fn solve_patch(
        &self,
        idx: usize,
        residual: &Vector,
        constraint_residual: &Vector,
    ) -> Result<Vector> {
        let patch = &self.patches[idx];
        let rhs = patch.rhs(residual, constraint_residual);
        let solution = match self.mode {
            FactorizationMode::Cached => self.factors[idx].solve(&rhs),
            FactorizationMode::Fresh => {
                let f = factorize(patch, self.level, idx)?;
                f.solve(&rhs)
            }
        };
        solution.map_err(|_| SolverError::SingularLocalSystem {
            level: self.level,
            patch: idx,
        })
    }

    /// Additive combination of all patch corrections for the given block
    /// residual and constraint residual. Multiplier components are internal
    /// to each patch and discarded.
    pub fn apply(&self, residual: &Vector, constraint_residual: &Vector) -> Result<Vector> {
        let solutions: Vec<Vector> = (0..self.patches.len())
            .into_par_iter()
            .map(|idx| self.solve_patch(idx, residual, constraint_residual))
            .collect::<Result<Vec<_>>>()?;

        let mut out = Vector::zeros(residual.len());
        for (patch, solution) in self.patches.iter().zip(solutions.iter()) {
            patch.scatter(solution, &mut out);
        }
        Ok(out)
    }

    /// Correction from a single patch, accumulated into `out`. Exists so the
    /// additive property is observable from outside.
    pub fn apply_patch(
        &self,
        idx: usize,
        residual: &Vector,
        constraint_residual: &Vector,
        out: &mut Vector,
    ) -> Result<()> {
        let solution = self.solve_patch(idx, residual, constraint_residual)?;
        self.patches[idx].scatter(&solution, out);
        Ok(())
    }
}
