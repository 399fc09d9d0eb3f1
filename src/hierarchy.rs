//! Multilevel hierarchy for the constrained minimization problem.
//!
//! A [`Hierarchy`] owns every per-level operator the cycle needs: the block
//! functional over [Hdiv; H1], the divergence constraint, the boundary-aware
//! curl, and the block transfers between consecutive levels. The finest
//! functional and constraint come assembled from the discretization layer;
//! every coarser operator is the Galerkin product through boundary-modified
//! transfers, so essential boundary conditions are enforced identically on
//! all levels.
//!
//! Construction validates all operator dimensions up front and fails with a
//! [`SolverError::Configuration`] instead of panicking mid-cycle.

use std::fmt;

use crate::error::{Result, SolverError};
use crate::utils::{block_matrix, eliminate_rows_cols, zero_cols, zero_rows};
use crate::CsrMatrix;

/// The four conforming spaces a level carries. `Hdiv` and `H1` make up the
/// solution block; `L2` hosts the constraint; `Hcurl` parametrizes the
/// divergence-free subspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Hdiv,
    L2,
    Hcurl,
    H1,
}

/// Sizes of the two solution blocks. The Hdiv block always comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOffsets {
    pub n_hdiv: usize,
    pub n_h1: usize,
}

impl BlockOffsets {
    pub fn total(&self) -> usize {
        self.n_hdiv + self.n_h1
    }

    pub fn hdiv_range(&self) -> std::ops::Range<usize> {
        0..self.n_hdiv
    }

    pub fn h1_range(&self) -> std::ops::Range<usize> {
        self.n_hdiv..self.total()
    }
}

/// Identity dof numbering. In a serial build every dof is its own true dof;
/// keeping the map explicit lets the patch solver stay oblivious to dof
/// sharing conventions.
#[derive(Debug, Clone, Copy)]
pub struct TrueDofMap {
    len: usize,
}

impl TrueDofMap {
    pub fn identity(len: usize) -> Self {
        Self { len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_true(&self, dof: usize) -> usize {
        debug_assert!(dof < self.len);
        dof
    }
}

/// Cell-to-agglomerate map between a fine level and the next coarser one.
/// Agglomerates are the supports of the local patch solves.
#[derive(Debug, Clone)]
pub struct Agglomeration {
    cell_to_agg: Vec<usize>,
    agg_to_cells: Vec<Vec<usize>>,
}

impl Agglomeration {
    pub fn from_cell_map(cell_to_agg: Vec<usize>, num_aggs: usize) -> Self {
        let mut agg_to_cells = vec![Vec::new(); num_aggs];
        for (cell, &agg) in cell_to_agg.iter().enumerate() {
            agg_to_cells[agg].push(cell);
        }
        Self {
            cell_to_agg,
            agg_to_cells,
        }
    }

    pub fn num_aggs(&self) -> usize {
        self.agg_to_cells.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cell_to_agg.len()
    }

    pub fn agg_of(&self, cell: usize) -> usize {
        self.cell_to_agg[cell]
    }

    pub fn cells_of(&self, agg: usize) -> &[usize] {
        &self.agg_to_cells[agg]
    }
}

/// Per-level raw material from the discretization layer: space sizes,
/// boundary masks, the curl operator, and element-to-dof connectivity.
/// `ess_*` masks flag essential-condition dofs; `bdr_hdiv` flags every
/// boundary face regardless of condition type. H1 fields are empty when the
/// problem has no auxiliary scalar.
pub struct LevelInput {
    pub n_hdiv: usize,
    pub n_l2: usize,
    pub n_hcurl: usize,
    pub n_h1: usize,
    pub ess_hdiv: Vec<bool>,
    pub bdr_hdiv: Vec<bool>,
    pub ess_hcurl: Vec<bool>,
    pub ess_h1: Vec<bool>,
    pub curl: CsrMatrix,
    pub elem_to_hdiv: Vec<Vec<usize>>,
    pub elem_to_h1: Vec<Vec<usize>>,
}

/// Per-pair raw material: the four interpolation operators from a coarse
/// level into the next finer one, plus the agglomeration induced by the
/// coarse cells.
pub struct TransferInput {
    pub hdiv: CsrMatrix,
    pub l2: CsrMatrix,
    pub hcurl: CsrMatrix,
    pub h1: Option<CsrMatrix>,
    pub agglomeration: Agglomeration,
}

/// One level of the hierarchy, fully assembled.
pub struct Level {
    /// Block functional over [Hdiv; H1], essential dofs decoupled to
    /// identity rows/columns.
    pub functional: CsrMatrix,
    /// Divergence constraint, L2 x Hdiv, essential columns zeroed.
    pub constraint: CsrMatrix,
    /// Curl with essential edge columns zeroed; its range is the
    /// boundary-conforming divergence-free subspace.
    pub curl: CsrMatrix,
    pub offsets: BlockOffsets,
    input: LevelInput,
}

impl Level {
    pub fn input(&self) -> &LevelInput {
        &self.input
    }

    /// Essential mask over the stacked [Hdiv; H1] block vector.
    pub fn ess_block_mask(&self) -> Vec<bool> {
        let mut mask = self.input.ess_hdiv.clone();
        mask.extend(self.input.ess_h1.iter());
        mask
    }

    pub fn true_dofs(&self, kind: SpaceKind) -> TrueDofMap {
        let n = match kind {
            SpaceKind::Hdiv => self.input.n_hdiv,
            SpaceKind::L2 => self.input.n_l2,
            SpaceKind::Hcurl => self.input.n_hcurl,
            SpaceKind::H1 => self.input.n_h1,
        };
        TrueDofMap::identity(n)
    }

    /// Essential-boundary dofs of one space, in local and true numbering.
    /// The constraint space is unconstrained and returns empty sets.
    pub fn essential_dofs(&self, kind: SpaceKind) -> (Vec<usize>, Vec<usize>) {
        let mask: &[bool] = match kind {
            SpaceKind::Hdiv => &self.input.ess_hdiv,
            SpaceKind::L2 => &[],
            SpaceKind::Hcurl => &self.input.ess_hcurl,
            SpaceKind::H1 => &self.input.ess_h1,
        };
        let map = self.true_dofs(kind);
        let local: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, &flagged)| flagged)
            .map(|(d, _)| d)
            .collect();
        let dist = local.iter().map(|&d| map.to_true(d)).collect();
        (local, dist)
    }
}

/// Assembled transfer between two consecutive levels.
pub struct Transfer {
    /// Stacked [Hdiv; H1] interpolation with fine essential rows and coarse
    /// essential columns zeroed. This is the operator the cycle applies.
    pub block: CsrMatrix,
    /// Transpose of `block`, precomputed for residual restriction.
    pub restriction: CsrMatrix,
    /// Boundary-modified Hdiv component, used for the coarse constraint.
    pub hdiv: CsrMatrix,
    /// Unmodified L2 interpolation; the constraint space has no boundary.
    pub l2: CsrMatrix,
    /// Transpose of `l2`, the aggregation of constraint data.
    pub l2_restriction: CsrMatrix,
    /// Hcurl interpolation with essential edge rows/columns zeroed.
    pub hcurl: CsrMatrix,
    pub agglomeration: Agglomeration,
}

/// The multilevel arena: levels ordered finest (0) to coarsest, with
/// `num_levels() - 1` transfers between them. All operators are owned here;
/// solver components borrow.
pub struct Hierarchy {
    levels: Vec<Level>,
    transfers: Vec<Transfer>,
}

fn check_dims(cond: bool, what: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(SolverError::Configuration(format!(
            "dimension mismatch: {what}"
        )))
    }
}

fn galerkin(p: &CsrMatrix, mat: &CsrMatrix) -> CsrMatrix {
    let pt = p.transpose_view().to_csr();
    (&pt * &(mat * p).to_csr()).to_csr()
}

impl Hierarchy {
    /// Build the hierarchy from the finest assembled operators and the raw
    /// per-level inputs. `levels` and `transfers` are ordered finest first;
    /// `functional` and `constraint` belong to `levels[0]` and must already
    /// have essential conditions eliminated.
    pub fn build(
        functional: CsrMatrix,
        constraint: CsrMatrix,
        level_inputs: Vec<LevelInput>,
        transfer_inputs: Vec<TransferInput>,
    ) -> Result<Hierarchy> {
        if level_inputs.is_empty() {
            return Err(SolverError::Configuration("no levels given".into()));
        }
        check_dims(
            transfer_inputs.len() + 1 == level_inputs.len(),
            "one transfer per consecutive level pair",
        )?;

        for (i, input) in level_inputs.iter().enumerate() {
            check_dims(
                input.ess_hdiv.len() == input.n_hdiv && input.bdr_hdiv.len() == input.n_hdiv,
                "hdiv boundary masks",
            )?;
            check_dims(input.ess_hcurl.len() == input.n_hcurl, "hcurl boundary mask")?;
            check_dims(input.ess_h1.len() == input.n_h1, "h1 boundary mask")?;
            check_dims(
                input.curl.rows() == input.n_hdiv && input.curl.cols() == input.n_hcurl,
                "curl operator",
            )?;
            check_dims(
                input.elem_to_hdiv.len() == input.n_l2,
                "element-to-face connectivity",
            )?;
            if i + 1 < level_inputs.len() {
                let t = &transfer_inputs[i];
                let coarse = &level_inputs[i + 1];
                check_dims(
                    t.hdiv.rows() == input.n_hdiv && t.hdiv.cols() == coarse.n_hdiv,
                    "hdiv transfer",
                )?;
                check_dims(
                    t.l2.rows() == input.n_l2 && t.l2.cols() == coarse.n_l2,
                    "l2 transfer",
                )?;
                check_dims(
                    t.hcurl.rows() == input.n_hcurl && t.hcurl.cols() == coarse.n_hcurl,
                    "hcurl transfer",
                )?;
                match &t.h1 {
                    Some(p) => check_dims(
                        p.rows() == input.n_h1 && p.cols() == coarse.n_h1,
                        "h1 transfer",
                    )?,
                    None => check_dims(input.n_h1 == 0, "missing h1 transfer")?,
                }
                check_dims(
                    t.agglomeration.num_cells() == input.n_l2
                        && t.agglomeration.num_aggs() == coarse.n_l2,
                    "agglomeration",
                )?;
            }
        }

        let finest = &level_inputs[0];
        let offsets = BlockOffsets {
            n_hdiv: finest.n_hdiv,
            n_h1: finest.n_h1,
        };
        check_dims(
            functional.rows() == offsets.total() && functional.cols() == offsets.total(),
            "finest functional",
        )?;
        check_dims(
            constraint.rows() == finest.n_l2 && constraint.cols() == finest.n_hdiv,
            "finest constraint",
        )?;

        let mut level_inputs = level_inputs;
        let mut transfer_inputs = transfer_inputs;

        let mut levels = Vec::with_capacity(level_inputs.len());
        let mut transfers = Vec::with_capacity(transfer_inputs.len());

        // Finest level takes the assembled operators directly.
        let input = level_inputs.remove(0);
        let curl = zero_cols(&input.curl, &input.ess_hcurl);
        levels.push(Level {
            functional,
            constraint,
            curl,
            offsets,
            input,
        });

        for input in level_inputs {
            let t = transfer_inputs.remove(0);
            let fine = levels.last().unwrap();

            let coarse_offsets = BlockOffsets {
                n_hdiv: input.n_hdiv,
                n_h1: input.n_h1,
            };

            // Boundary-modified block transfer: corrections never come from
            // or land on essential dofs.
            let raw_block = match &t.h1 {
                Some(h1) => block_matrix(
                    &[fine.offsets.n_hdiv, fine.offsets.n_h1],
                    &[coarse_offsets.n_hdiv, coarse_offsets.n_h1],
                    &[(0, 0, &t.hdiv), (1, 1, h1)],
                ),
                None => t.hdiv.clone(),
            };
            let fine_mask = fine.ess_block_mask();
            let mut coarse_mask = input.ess_hdiv.clone();
            coarse_mask.extend(input.ess_h1.iter());
            let block = zero_cols(&zero_rows(&raw_block, &fine_mask), &coarse_mask);

            let hdiv_mod = zero_cols(
                &zero_rows(&t.hdiv, &fine.input.ess_hdiv),
                &input.ess_hdiv,
            );
            let hcurl_mod = zero_cols(
                &zero_rows(&t.hcurl, &fine.input.ess_hcurl),
                &input.ess_hcurl,
            );

            // Galerkin coarse functional; re-insert the identity so coarse
            // essential dofs stay decoupled like the finest ones.
            let functional = eliminate_rows_cols(&galerkin(&block, &fine.functional), &coarse_mask);

            // Coarse constraint: restrict through the L2 embedding, interpolate
            // through the modified Hdiv transfer. Scaled relative to a direct
            // assembly, which is harmless since every level is consistent with
            // its own transfer.
            let l2_t = t.l2.transpose_view().to_csr();
            let constraint = (&l2_t * &(&fine.constraint * &hdiv_mod).to_csr()).to_csr();

            let curl = zero_cols(&input.curl, &input.ess_hcurl);

            levels.push(Level {
                functional,
                constraint,
                curl,
                offsets: coarse_offsets,
                input,
            });
            let restriction = block.transpose_view().to_csr();
            transfers.push(Transfer {
                block,
                restriction,
                hdiv: hdiv_mod,
                l2: t.l2,
                l2_restriction: l2_t,
                hcurl: hcurl_mod,
                agglomeration: t.agglomeration,
            });
        }

        Ok(Hierarchy { levels, transfers })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> Result<&Level> {
        self.levels.get(level).ok_or(SolverError::OutOfRange {
            level,
            levels: self.levels.len(),
            what: "level",
        })
    }

    /// Transfer between `level` and `level + 1`.
    pub fn transfer(&self, level: usize) -> Result<&Transfer> {
        self.transfers.get(level).ok_or(SolverError::OutOfRange {
            level,
            levels: self.levels.len(),
            what: "transfer",
        })
    }

    pub fn finest(&self) -> &Level {
        &self.levels[0]
    }

    pub fn coarsest(&self) -> &Level {
        self.levels.last().unwrap()
    }

    /// Interpolation for one space between `level` and `level + 1`. The
    /// block operator in [`Transfer::block`] covers the solution vector;
    /// this accessor exists for space-by-space diagnostics.
    pub fn space_transfer(&self, level: usize, kind: SpaceKind) -> Result<&CsrMatrix> {
        let t = self.transfer(level)?;
        match kind {
            SpaceKind::Hdiv => Ok(&t.hdiv),
            SpaceKind::L2 => Ok(&t.l2),
            SpaceKind::Hcurl => Ok(&t.hcurl),
            SpaceKind::H1 => Err(SolverError::Configuration(
                "h1 transfer only exists inside the block operator".into(),
            )),
        }
    }
}

impl fmt::Debug for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hierarchy with {} levels", self.levels.len())?;
        let finest_nnz = self.levels[0].functional.nnz();
        let mut total_nnz = 0;
        for (i, level) in self.levels.iter().enumerate() {
            total_nnz += level.functional.nnz();
            writeln!(
                f,
                "  level {i}: hdiv {} h1 {} l2 {} hcurl {} functional nnz {}",
                level.offsets.n_hdiv,
                level.offsets.n_h1,
                level.input.n_l2,
                level.input.n_hcurl,
                level.functional.nnz(),
            )?;
        }
        writeln!(
            f,
            "  operator complexity: {:.2}",
            total_nnz as f64 / finest_nnz as f64
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{transport_problem, CartesianGrid};
    use crate::utils::eliminate_rows_cols;

    fn build_transport(n: usize, levels: usize, ess: [bool; 6]) -> (Hierarchy, Vec<CartesianGrid>) {
        let problem = transport_problem(CartesianGrid::cube(n), levels, ess).unwrap();
        let grids = problem.grids.clone();
        let h = Hierarchy::build(
            problem.functional,
            problem.constraint,
            problem.levels,
            problem.transfers,
        )
        .unwrap();
        (h, grids)
    }

    #[test]
    fn galerkin_functional_matches_direct_assembly() {
        // The transfers embed the coarse spaces exactly, so the Galerkin
        // coarse functional equals the directly assembled one.
        let ess = [true, false, true, false, false, true];
        let (h, grids) = build_transport(4, 2, ess);

        let coarse = &grids[1];
        let mass = coarse.hdiv_mass();
        let div = coarse.divergence();
        let w = coarse.l2_mass();
        let div_t = div.transpose_view().to_csr();
        let div_term = (&div_t * &(&w * &div).to_csr()).to_csr();
        let direct = (&mass + &div_term).to_csr();
        let direct = eliminate_rows_cols(&direct, &coarse.boundary_face_mask(&ess));

        let galerkin = &h.level(1).unwrap().functional;
        let gd = galerkin.to_dense();
        let dd = direct.to_dense();
        assert_eq!(gd.dim(), dd.dim());
        for i in 0..gd.nrows() {
            for j in 0..gd.ncols() {
                assert!(
                    (gd[[i, j]] - dd[[i, j]]).abs() < 1e-12,
                    "mismatch at ({i},{j}): {} vs {}",
                    gd[[i, j]],
                    dd[[i, j]]
                );
            }
        }
    }

    #[test]
    fn coarse_constraint_is_scaled_direct_constraint() {
        let ess = [true, true, false, false, true, false];
        let (h, grids) = build_transport(4, 2, ess);

        let coarse = &grids[1];
        let direct = crate::utils::zero_cols(
            &coarse.divergence(),
            &coarse.boundary_face_mask(&ess),
        );

        let built = &h.level(1).unwrap().constraint;
        let bd = built.to_dense();
        let dd = direct.to_dense();
        for i in 0..bd.nrows() {
            for j in 0..bd.ncols() {
                // L2 restriction sums the 8 children, hence the factor.
                assert!(
                    (bd[[i, j]] - 8.0 * dd[[i, j]]).abs() < 1e-12,
                    "mismatch at ({i},{j})"
                );
            }
        }
    }

    #[test]
    fn constraint_annihilates_curl_on_every_level() {
        let ess = [true, false, false, true, true, false];
        let (h, _) = build_transport(4, 2, ess);

        for l in 0..h.num_levels() {
            let level = h.level(l).unwrap();
            let product = (&level.constraint * &level.curl).to_csr();
            assert!(
                product.data().iter().all(|v| v.abs() < 1e-12),
                "constraint * curl != 0 on level {l}"
            );
        }
    }

    #[test]
    fn essential_dofs_are_decoupled_on_coarse_levels() {
        let ess = [true; 6];
        let (h, _) = build_transport(4, 2, ess);

        let level = h.level(1).unwrap();
        let dense = level.functional.to_dense();
        for (i, &flagged) in level.ess_block_mask().iter().enumerate() {
            if !flagged {
                continue;
            }
            for j in 0..dense.ncols() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dense[[i, j]] - expected).abs() < 1e-14);
                assert!((dense[[j, i]] - expected).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn essential_dofs_match_the_masks() {
        let ess = [true, false, false, false, false, false];
        let (h, grids) = build_transport(4, 2, ess);
        let level = h.level(0).unwrap();

        let (local, dist) = level.essential_dofs(SpaceKind::Hdiv);
        // Serial numbering: local and distributed coincide.
        assert_eq!(local, dist);
        let expected: Vec<usize> = grids[0]
            .boundary_face_mask(&ess)
            .iter()
            .enumerate()
            .filter(|(_, &b)| b)
            .map(|(d, _)| d)
            .collect();
        assert_eq!(local, expected);
        assert!(level.essential_dofs(SpaceKind::L2).0.is_empty());
    }

    #[test]
    fn build_rejects_mismatched_dimensions() {
        let problem = transport_problem(CartesianGrid::cube(4), 2, [false; 6]).unwrap();
        let mut levels = problem.levels;
        levels[1].n_hdiv += 1;
        let err = Hierarchy::build(
            problem.functional,
            problem.constraint,
            levels,
            problem.transfers,
        );
        assert!(matches!(err, Err(SolverError::Configuration(_))));
    }

    #[test]
    fn accessors_report_out_of_range() {
        let (h, _) = build_transport(2, 1, [false; 6]);
        assert!(matches!(
            h.level(3),
            Err(SolverError::OutOfRange { level: 3, .. })
        ));
        assert!(matches!(h.transfer(0), Err(SolverError::OutOfRange { .. })));
    }
}
