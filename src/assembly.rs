//! Structured-grid stand-in for the finite-element assembly layer.
//!
//! The solver core never assembles operators itself beyond Galerkin
//! projection; it consumes assembled matrices from a collaborator. This
//! module plays that collaborator on an axis-aligned hexahedral grid of the
//! unit cube with lowest-order mimetic spaces: face dofs (fluxes) for the
//! vector field, cell dofs (averages) for the constraint space, edge dofs
//! (circulations) for the divergence-free potential space, and vertex dofs
//! for the optional auxiliary scalar field.
//!
//! Everything is built from signed incidence so the discrete complex is
//! exact: `div * curl = 0` and `curl * grad = 0` hold entry-wise, and the
//! prolongations are the exact embeddings of the nested coarse spaces, so
//! Galerkin coarse Gram matrices coincide with directly assembled ones.

use crate::error::{Result, SolverError};
use crate::hierarchy::{Agglomeration, LevelInput, TransferInput};
use crate::solver::{l1_inverse, pcg, SolveInfo};
use crate::utils::{block_matrix, eliminate_rows_cols, zero_cols};
use crate::{CooMatrix, CsrMatrix, Vector};

/// Boundary attribute count: one attribute per cube side, ordered
/// x=0, x=1, y=0, y=1, z=0, z=1.
pub const NUM_BDR_ATTRS: usize = 6;

/// Uniform hexahedral grid on the unit cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartesianGrid {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl CartesianGrid {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        assert!(nx > 0 && ny > 0 && nz > 0);
        Self { nx, ny, nz }
    }

    pub fn cube(n: usize) -> Self {
        Self::new(n, n, n)
    }

    pub fn hx(&self) -> f64 {
        1.0 / self.nx as f64
    }
    pub fn hy(&self) -> f64 {
        1.0 / self.ny as f64
    }
    pub fn hz(&self) -> f64 {
        1.0 / self.nz as f64
    }
    pub fn cell_volume(&self) -> f64 {
        self.hx() * self.hy() * self.hz()
    }

    pub fn num_cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    fn num_x_faces(&self) -> usize {
        (self.nx + 1) * self.ny * self.nz
    }
    fn num_y_faces(&self) -> usize {
        self.nx * (self.ny + 1) * self.nz
    }
    fn num_z_faces(&self) -> usize {
        self.nx * self.ny * (self.nz + 1)
    }

    pub fn num_faces(&self) -> usize {
        self.num_x_faces() + self.num_y_faces() + self.num_z_faces()
    }

    fn num_x_edges(&self) -> usize {
        self.nx * (self.ny + 1) * (self.nz + 1)
    }
    fn num_y_edges(&self) -> usize {
        (self.nx + 1) * self.ny * (self.nz + 1)
    }
    fn num_z_edges(&self) -> usize {
        (self.nx + 1) * (self.ny + 1) * self.nz
    }

    pub fn num_edges(&self) -> usize {
        self.num_x_edges() + self.num_y_edges() + self.num_z_edges()
    }

    pub fn num_vertices(&self) -> usize {
        (self.nx + 1) * (self.ny + 1) * (self.nz + 1)
    }

    pub fn cell(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.nx * (j + self.ny * k)
    }

    // Face numbering: x-normal faces first, then y, then z.
    fn x_face(&self, i: usize, j: usize, k: usize) -> usize {
        i + (self.nx + 1) * (j + self.ny * k)
    }
    fn y_face(&self, i: usize, j: usize, k: usize) -> usize {
        self.num_x_faces() + i + self.nx * (j + (self.ny + 1) * k)
    }
    fn z_face(&self, i: usize, j: usize, k: usize) -> usize {
        self.num_x_faces() + self.num_y_faces() + i + self.nx * (j + self.ny * k)
    }

    // Edge numbering: x-aligned first, then y, then z.
    fn x_edge(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.nx * (j + (self.ny + 1) * k)
    }
    fn y_edge(&self, i: usize, j: usize, k: usize) -> usize {
        self.num_x_edges() + i + (self.nx + 1) * (j + self.ny * k)
    }
    fn z_edge(&self, i: usize, j: usize, k: usize) -> usize {
        self.num_x_edges() + self.num_y_edges() + i + (self.nx + 1) * (j + (self.ny + 1) * k)
    }

    pub fn vertex(&self, i: usize, j: usize, k: usize) -> usize {
        i + (self.nx + 1) * (j + (self.ny + 1) * k)
    }

    /// Discrete divergence, cells x faces. Cell dofs are averages, face dofs
    /// are fluxes oriented along the positive axes, so entries are
    /// +-1/volume.
    pub fn divergence(&self) -> CsrMatrix {
        let inv_vol = 1.0 / self.cell_volume();
        let mut d = CooMatrix::new((self.num_cells(), self.num_faces()));
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let c = self.cell(i, j, k);
                    d.add_triplet(c, self.x_face(i + 1, j, k), inv_vol);
                    d.add_triplet(c, self.x_face(i, j, k), -inv_vol);
                    d.add_triplet(c, self.y_face(i, j + 1, k), inv_vol);
                    d.add_triplet(c, self.y_face(i, j, k), -inv_vol);
                    d.add_triplet(c, self.z_face(i, j, k + 1), inv_vol);
                    d.add_triplet(c, self.z_face(i, j, k), -inv_vol);
                }
            }
        }
        d.to_csr()
    }

    /// Discrete curl, faces x edges: signed circulation of the edge dofs
    /// around each face, right-hand rule about the face normal.
    /// `divergence() * curl()` vanishes identically.
    pub fn curl(&self) -> CsrMatrix {
        let mut c = CooMatrix::new((self.num_faces(), self.num_edges()));
        // x-normal faces: circulation over y/z edges.
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    let f = self.x_face(i, j, k);
                    c.add_triplet(f, self.y_edge(i, j, k), 1.0);
                    c.add_triplet(f, self.z_edge(i, j + 1, k), 1.0);
                    c.add_triplet(f, self.y_edge(i, j, k + 1), -1.0);
                    c.add_triplet(f, self.z_edge(i, j, k), -1.0);
                }
            }
        }
        // y-normal faces: circulation over z/x edges.
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    let f = self.y_face(i, j, k);
                    c.add_triplet(f, self.z_edge(i, j, k), 1.0);
                    c.add_triplet(f, self.x_edge(i, j, k + 1), 1.0);
                    c.add_triplet(f, self.z_edge(i + 1, j, k), -1.0);
                    c.add_triplet(f, self.x_edge(i, j, k), -1.0);
                }
            }
        }
        // z-normal faces: circulation over x/y edges.
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let f = self.z_face(i, j, k);
                    c.add_triplet(f, self.x_edge(i, j, k), 1.0);
                    c.add_triplet(f, self.y_edge(i + 1, j, k), 1.0);
                    c.add_triplet(f, self.x_edge(i, j + 1, k), -1.0);
                    c.add_triplet(f, self.y_edge(i, j, k), -1.0);
                }
            }
        }
        c.to_csr()
    }

    /// Discrete gradient, edges x vertices: end minus start along each edge.
    /// `curl() * gradient()` vanishes identically.
    pub fn gradient(&self) -> CsrMatrix {
        let mut g = CooMatrix::new((self.num_edges(), self.num_vertices()));
        for k in 0..=self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    let e = self.x_edge(i, j, k);
                    g.add_triplet(e, self.vertex(i + 1, j, k), 1.0);
                    g.add_triplet(e, self.vertex(i, j, k), -1.0);
                }
            }
        }
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    let e = self.y_edge(i, j, k);
                    g.add_triplet(e, self.vertex(i, j + 1, k), 1.0);
                    g.add_triplet(e, self.vertex(i, j, k), -1.0);
                }
            }
        }
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..=self.nx {
                    let e = self.z_edge(i, j, k);
                    g.add_triplet(e, self.vertex(i, j, k + 1), 1.0);
                    g.add_triplet(e, self.vertex(i, j, k), -1.0);
                }
            }
        }
        g.to_csr()
    }

    /// Exact Gram matrix of the lowest-order Raviart-Thomas face basis
    /// (unit-flux convention). Tridiagonal along each axis line; the three
    /// axis families are mutually orthogonal.
    pub fn hdiv_mass(&self) -> CsrMatrix {
        let mut m = CooMatrix::new((self.num_faces(), self.num_faces()));
        let (hx, hy, hz) = (self.hx(), self.hy(), self.hz());

        // x-family: area hy*hz, extent hx.
        let (diag, off) = (hx / (3.0 * hy * hz), hx / (6.0 * hy * hz));
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    let f = self.x_face(i, j, k);
                    let cells = (i > 0) as usize + (i < self.nx) as usize;
                    m.add_triplet(f, f, diag * cells as f64);
                    if i < self.nx {
                        let g = self.x_face(i + 1, j, k);
                        m.add_triplet(f, g, off);
                        m.add_triplet(g, f, off);
                    }
                }
            }
        }
        let (diag, off) = (hy / (3.0 * hx * hz), hy / (6.0 * hx * hz));
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    let f = self.y_face(i, j, k);
                    let cells = (j > 0) as usize + (j < self.ny) as usize;
                    m.add_triplet(f, f, diag * cells as f64);
                    if j < self.ny {
                        let g = self.y_face(i, j + 1, k);
                        m.add_triplet(f, g, off);
                        m.add_triplet(g, f, off);
                    }
                }
            }
        }
        let (diag, off) = (hz / (3.0 * hx * hy), hz / (6.0 * hx * hy));
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let f = self.z_face(i, j, k);
                    let cells = (k > 0) as usize + (k < self.nz) as usize;
                    m.add_triplet(f, f, diag * cells as f64);
                    if k < self.nz {
                        let g = self.z_face(i, j, k + 1);
                        m.add_triplet(f, g, off);
                        m.add_triplet(g, f, off);
                    }
                }
            }
        }
        m.to_csr()
    }

    /// Gram matrix of the piecewise-constant cell basis: diag(volume).
    pub fn l2_mass(&self) -> CsrMatrix {
        let vol = self.cell_volume();
        let n = self.num_cells();
        let mut m = CooMatrix::new((n, n));
        for c in 0..n {
            m.add_triplet(c, c, vol);
        }
        m.to_csr()
    }

    /// Lumped edge mass, scaled so that gradient^T * edge_mass * gradient is
    /// the standard 7-point Laplacian with natural boundary scaling.
    pub fn edge_mass(&self) -> CsrMatrix {
        let mut m = CooMatrix::new((self.num_edges(), self.num_edges()));
        let (hx, hy, hz) = (self.hx(), self.hy(), self.hz());

        let w = hy * hz / hx / 4.0;
        for k in 0..=self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    let adj = ((j > 0) as usize + (j < self.ny) as usize)
                        * ((k > 0) as usize + (k < self.nz) as usize);
                    let e = self.x_edge(i, j, k);
                    m.add_triplet(e, e, w * adj as f64);
                }
            }
        }
        let w = hx * hz / hy / 4.0;
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    let adj = ((i > 0) as usize + (i < self.nx) as usize)
                        * ((k > 0) as usize + (k < self.nz) as usize);
                    let e = self.y_edge(i, j, k);
                    m.add_triplet(e, e, w * adj as f64);
                }
            }
        }
        let w = hx * hy / hz / 4.0;
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..=self.nx {
                    let adj = ((i > 0) as usize + (i < self.nx) as usize)
                        * ((j > 0) as usize + (j < self.ny) as usize);
                    let e = self.z_edge(i, j, k);
                    m.add_triplet(e, e, w * adj as f64);
                }
            }
        }
        m.to_csr()
    }

    /// Cell-difference gradient flux, faces x vertices: the flux of the
    /// gradient of a vertex field through each interior face, computed from
    /// the difference of the adjacent cell averages. Zero on boundary faces.
    /// Couples the auxiliary scalar field into the vector-field functional.
    pub fn gradient_flux(&self) -> CsrMatrix {
        let mut g = CooMatrix::new((self.num_faces(), self.num_vertices()));
        let (hx, hy, hz) = (self.hx(), self.hy(), self.hz());

        let mut cell_vertices = |gm: &mut CooMatrix, f: usize, ci: usize, cj: usize, ck: usize, w: f64| {
            for dz in 0..2 {
                for dy in 0..2 {
                    for dx in 0..2 {
                        gm.add_triplet(f, self.vertex(ci + dx, cj + dy, ck + dz), w / 8.0);
                    }
                }
            }
        };

        let w = hy * hz / hx;
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 1..self.nx {
                    let f = self.x_face(i, j, k);
                    cell_vertices(&mut g, f, i, j, k, w);
                    cell_vertices(&mut g, f, i - 1, j, k, -w);
                }
            }
        }
        let w = hx * hz / hy;
        for k in 0..self.nz {
            for j in 1..self.ny {
                for i in 0..self.nx {
                    let f = self.y_face(i, j, k);
                    cell_vertices(&mut g, f, i, j, k, w);
                    cell_vertices(&mut g, f, i, j - 1, k, -w);
                }
            }
        }
        let w = hx * hy / hz;
        for k in 1..self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let f = self.z_face(i, j, k);
                    cell_vertices(&mut g, f, i, j, k, w);
                    cell_vertices(&mut g, f, i, j, k - 1, -w);
                }
            }
        }
        g.to_csr()
    }

    /// Boundary attribute of a face (0..6), or None for interior faces.
    pub fn face_boundary_attr(&self, face: usize) -> Option<usize> {
        let nxf = self.num_x_faces();
        let nyf = self.num_y_faces();
        if face < nxf {
            let i = face % (self.nx + 1);
            if i == 0 {
                return Some(0);
            }
            if i == self.nx {
                return Some(1);
            }
        } else if face < nxf + nyf {
            let j = (face - nxf) / self.nx % (self.ny + 1);
            if j == 0 {
                return Some(2);
            }
            if j == self.ny {
                return Some(3);
            }
        } else {
            let k = (face - nxf - nyf) / (self.nx * self.ny);
            if k == 0 {
                return Some(4);
            }
            if k == self.nz {
                return Some(5);
            }
        }
        None
    }

    /// Face mask for the sides flagged in `attrs`.
    pub fn boundary_face_mask(&self, attrs: &[bool; NUM_BDR_ATTRS]) -> Vec<bool> {
        (0..self.num_faces())
            .map(|f| self.face_boundary_attr(f).map_or(false, |a| attrs[a]))
            .collect()
    }

    /// Edge mask: an edge is flagged when it lies in the closure of a
    /// flagged side. Matches the trace of the flagged face set, so zeroing
    /// these edge columns of the curl zeroes exactly the flagged face rows.
    pub fn boundary_edge_mask(&self, attrs: &[bool; NUM_BDR_ATTRS]) -> Vec<bool> {
        let mut mask = vec![false; self.num_edges()];
        for k in 0..=self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    mask[self.x_edge(i, j, k)] = (j == 0 && attrs[2])
                        || (j == self.ny && attrs[3])
                        || (k == 0 && attrs[4])
                        || (k == self.nz && attrs[5]);
                }
            }
        }
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    mask[self.y_edge(i, j, k)] = (i == 0 && attrs[0])
                        || (i == self.nx && attrs[1])
                        || (k == 0 && attrs[4])
                        || (k == self.nz && attrs[5]);
                }
            }
        }
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..=self.nx {
                    mask[self.z_edge(i, j, k)] = (i == 0 && attrs[0])
                        || (i == self.nx && attrs[1])
                        || (j == 0 && attrs[2])
                        || (j == self.ny && attrs[3]);
                }
            }
        }
        mask
    }

    pub fn boundary_vertex_mask(&self, attrs: &[bool; NUM_BDR_ATTRS]) -> Vec<bool> {
        let mut mask = vec![false; self.num_vertices()];
        for k in 0..=self.nz {
            for j in 0..=self.ny {
                for i in 0..=self.nx {
                    mask[self.vertex(i, j, k)] = (i == 0 && attrs[0])
                        || (i == self.nx && attrs[1])
                        || (j == 0 && attrs[2])
                        || (j == self.ny && attrs[3])
                        || (k == 0 && attrs[4])
                        || (k == self.nz && attrs[5]);
                }
            }
        }
        mask
    }

    pub fn elem_to_faces(&self) -> Vec<Vec<usize>> {
        let mut map = Vec::with_capacity(self.num_cells());
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    map.push(vec![
                        self.x_face(i, j, k),
                        self.x_face(i + 1, j, k),
                        self.y_face(i, j, k),
                        self.y_face(i, j + 1, k),
                        self.z_face(i, j, k),
                        self.z_face(i, j, k + 1),
                    ]);
                }
            }
        }
        map
    }

    pub fn elem_to_vertices(&self) -> Vec<Vec<usize>> {
        let mut map = Vec::with_capacity(self.num_cells());
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let mut verts = Vec::with_capacity(8);
                    for dz in 0..2 {
                        for dy in 0..2 {
                            for dx in 0..2 {
                                verts.push(self.vertex(i + dx, j + dy, k + dz));
                            }
                        }
                    }
                    map.push(verts);
                }
            }
        }
        map
    }

    /// Refine by two in every direction.
    pub fn refine(&self) -> CartesianGrid {
        CartesianGrid::new(2 * self.nx, 2 * self.ny, 2 * self.nz)
    }

    /// Coarsen by two; fails when any dimension is odd.
    pub fn coarsen(&self) -> Result<CartesianGrid> {
        if self.nx % 2 != 0 || self.ny % 2 != 0 || self.nz % 2 != 0 {
            return Err(SolverError::Configuration(format!(
                "grid {}x{}x{} cannot be coarsened by 2",
                self.nx, self.ny, self.nz
            )));
        }
        Ok(CartesianGrid::new(self.nx / 2, self.ny / 2, self.nz / 2))
    }

    /// Map from the cells of `self.refine()` to this grid's cells.
    pub fn agglomeration(&self) -> Agglomeration {
        let fine = self.refine();
        let mut cell_to_agg = vec![0usize; fine.num_cells()];
        for k in 0..fine.nz {
            for j in 0..fine.ny {
                for i in 0..fine.nx {
                    cell_to_agg[fine.cell(i, j, k)] = self.cell(i / 2, j / 2, k / 2);
                }
            }
        }
        Agglomeration::from_cell_map(cell_to_agg, self.num_cells())
    }

    /// Exact embedding of this grid's cell space into `self.refine()`'s:
    /// a piecewise-constant function keeps its value on the children.
    pub fn prolongation_l2(&self) -> CsrMatrix {
        let fine = self.refine();
        let mut p = CooMatrix::new((fine.num_cells(), self.num_cells()));
        for k in 0..fine.nz {
            for j in 0..fine.ny {
                for i in 0..fine.nx {
                    p.add_triplet(fine.cell(i, j, k), self.cell(i / 2, j / 2, k / 2), 1.0);
                }
            }
        }
        p.to_csr()
    }

    /// Exact embedding of the coarse Raviart-Thomas space: a unit coarse
    /// flux spreads 1/4 onto each co-planar child face and 1/8 onto the
    /// mid-plane faces of the adjacent coarse cells.
    pub fn prolongation_hdiv(&self) -> CsrMatrix {
        let fine = self.refine();
        let mut p = CooMatrix::new((fine.num_faces(), self.num_faces()));

        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    let coarse = self.x_face(i, j, k);
                    for dk in 0..2 {
                        for dj in 0..2 {
                            let (fj, fk) = (2 * j + dj, 2 * k + dk);
                            p.add_triplet(fine.x_face(2 * i, fj, fk), coarse, 0.25);
                            if i > 0 {
                                p.add_triplet(fine.x_face(2 * i - 1, fj, fk), coarse, 0.125);
                            }
                            if i < self.nx {
                                p.add_triplet(fine.x_face(2 * i + 1, fj, fk), coarse, 0.125);
                            }
                        }
                    }
                }
            }
        }
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    let coarse = self.y_face(i, j, k);
                    for dk in 0..2 {
                        for di in 0..2 {
                            let (fi, fk) = (2 * i + di, 2 * k + dk);
                            p.add_triplet(fine.y_face(fi, 2 * j, fk), coarse, 0.25);
                            if j > 0 {
                                p.add_triplet(fine.y_face(fi, 2 * j - 1, fk), coarse, 0.125);
                            }
                            if j < self.ny {
                                p.add_triplet(fine.y_face(fi, 2 * j + 1, fk), coarse, 0.125);
                            }
                        }
                    }
                }
            }
        }
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let coarse = self.z_face(i, j, k);
                    for dj in 0..2 {
                        for di in 0..2 {
                            let (fi, fj) = (2 * i + di, 2 * j + dj);
                            p.add_triplet(fine.z_face(fi, fj, 2 * k), coarse, 0.25);
                            if k > 0 {
                                p.add_triplet(fine.z_face(fi, fj, 2 * k - 1), coarse, 0.125);
                            }
                            if k < self.nz {
                                p.add_triplet(fine.z_face(fi, fj, 2 * k + 1), coarse, 0.125);
                            }
                        }
                    }
                }
            }
        }
        p.to_csr()
    }

    /// Exact embedding of the coarse edge (Nedelec) space: 1/2 on the two
    /// collinear children, decaying by halves onto the neighbouring
    /// parallel edge lines.
    pub fn prolongation_hcurl(&self) -> CsrMatrix {
        let fine = self.refine();
        let mut p = CooMatrix::new((fine.num_edges(), self.num_edges()));
        let deltas: [isize; 3] = [-1, 0, 1];

        for k in 0..=self.nz {
            for j in 0..=self.ny {
                for i in 0..self.nx {
                    let coarse = self.x_edge(i, j, k);
                    for &dj in &deltas {
                        for &dk in &deltas {
                            let fj = 2 * j as isize + dj;
                            let fk = 2 * k as isize + dk;
                            if fj < 0 || fk < 0 || fj > fine.ny as isize || fk > fine.nz as isize {
                                continue;
                            }
                            let w = 0.5 * 0.5_f64.powi(dj.abs() as i32 + dk.abs() as i32);
                            for di in 0..2 {
                                p.add_triplet(
                                    fine.x_edge(2 * i + di, fj as usize, fk as usize),
                                    coarse,
                                    w,
                                );
                            }
                        }
                    }
                }
            }
        }
        for k in 0..=self.nz {
            for j in 0..self.ny {
                for i in 0..=self.nx {
                    let coarse = self.y_edge(i, j, k);
                    for &di in &deltas {
                        for &dk in &deltas {
                            let fi = 2 * i as isize + di;
                            let fk = 2 * k as isize + dk;
                            if fi < 0 || fk < 0 || fi > fine.nx as isize || fk > fine.nz as isize {
                                continue;
                            }
                            let w = 0.5 * 0.5_f64.powi(di.abs() as i32 + dk.abs() as i32);
                            for dj in 0..2 {
                                p.add_triplet(
                                    fine.y_edge(fi as usize, 2 * j + dj, fk as usize),
                                    coarse,
                                    w,
                                );
                            }
                        }
                    }
                }
            }
        }
        for k in 0..self.nz {
            for j in 0..=self.ny {
                for i in 0..=self.nx {
                    let coarse = self.z_edge(i, j, k);
                    for &di in &deltas {
                        for &dj in &deltas {
                            let fi = 2 * i as isize + di;
                            let fj = 2 * j as isize + dj;
                            if fi < 0 || fj < 0 || fi > fine.nx as isize || fj > fine.ny as isize {
                                continue;
                            }
                            let w = 0.5 * 0.5_f64.powi(di.abs() as i32 + dj.abs() as i32);
                            for dk in 0..2 {
                                p.add_triplet(
                                    fine.z_edge(fi as usize, fj as usize, 2 * k + dk),
                                    coarse,
                                    w,
                                );
                            }
                        }
                    }
                }
            }
        }
        p.to_csr()
    }

    /// Trilinear vertex interpolation, the exact Q1 embedding.
    pub fn prolongation_h1(&self) -> CsrMatrix {
        let fine = self.refine();
        let mut p = CooMatrix::new((fine.num_vertices(), self.num_vertices()));
        let deltas: [isize; 3] = [-1, 0, 1];

        for k in 0..=self.nz {
            for j in 0..=self.ny {
                for i in 0..=self.nx {
                    let coarse = self.vertex(i, j, k);
                    for &di in &deltas {
                        for &dj in &deltas {
                            for &dk in &deltas {
                                let fi = 2 * i as isize + di;
                                let fj = 2 * j as isize + dj;
                                let fk = 2 * k as isize + dk;
                                if fi < 0
                                    || fj < 0
                                    || fk < 0
                                    || fi > fine.nx as isize
                                    || fj > fine.ny as isize
                                    || fk > fine.nz as isize
                                {
                                    continue;
                                }
                                let w = 0.5_f64
                                    .powi(di.abs() as i32 + dj.abs() as i32 + dk.abs() as i32);
                                p.add_triplet(
                                    fine.vertex(fi as usize, fj as usize, fk as usize),
                                    coarse,
                                    w,
                                );
                            }
                        }
                    }
                }
            }
        }
        p.to_csr()
    }
}

/// Everything the hierarchy needs, assembled for a stack of nested grids.
pub struct Problem {
    /// Finest-level functional, block over [Hdiv; H1], essential dofs
    /// eliminated to identity.
    pub functional: CsrMatrix,
    /// Finest-level constraint (cells x faces), essential columns zeroed.
    pub constraint: CsrMatrix,
    pub levels: Vec<LevelInput>,
    pub transfers: Vec<TransferInput>,
    pub grids: Vec<CartesianGrid>,
}

fn level_input(grid: &CartesianGrid, ess: &[bool; NUM_BDR_ATTRS], with_h1: Option<&[bool; NUM_BDR_ATTRS]>) -> LevelInput {
    let all = [true; NUM_BDR_ATTRS];
    LevelInput {
        n_hdiv: grid.num_faces(),
        n_l2: grid.num_cells(),
        n_hcurl: grid.num_edges(),
        n_h1: if with_h1.is_some() { grid.num_vertices() } else { 0 },
        ess_hdiv: grid.boundary_face_mask(ess),
        bdr_hdiv: grid.boundary_face_mask(&all),
        ess_hcurl: grid.boundary_edge_mask(ess),
        ess_h1: match with_h1 {
            Some(ess_h1) => grid.boundary_vertex_mask(ess_h1),
            None => Vec::new(),
        },
        curl: grid.curl(),
        elem_to_hdiv: grid.elem_to_faces(),
        elem_to_h1: match with_h1 {
            Some(_) => grid.elem_to_vertices(),
            None => Vec::new(),
        },
    }
}

/// Nested grid stack plus the per-level and per-pair hierarchy inputs,
/// finest first. Fails when the requested depth does not divide the mesh.
pub fn level_stack(
    finest: CartesianGrid,
    num_levels: usize,
    ess: [bool; NUM_BDR_ATTRS],
    with_h1: Option<[bool; NUM_BDR_ATTRS]>,
) -> Result<(Vec<CartesianGrid>, Vec<LevelInput>, Vec<TransferInput>)> {
    if num_levels == 0 {
        return Err(SolverError::Configuration("num_levels must be positive".into()));
    }
    let mut grids = vec![finest];
    for _ in 1..num_levels {
        let coarse = grids.last().unwrap().coarsen()?;
        grids.push(coarse);
    }

    let levels: Vec<LevelInput> = grids
        .iter()
        .map(|g| level_input(g, &ess, with_h1.as_ref()))
        .collect();

    let transfers: Vec<TransferInput> = grids
        .windows(2)
        .map(|pair| {
            let coarse = &pair[1];
            TransferInput {
                hdiv: coarse.prolongation_hdiv(),
                l2: coarse.prolongation_l2(),
                hcurl: coarse.prolongation_hcurl(),
                h1: with_h1.map(|_| coarse.prolongation_h1()),
                agglomeration: coarse.agglomeration(),
            }
        })
        .collect();

    Ok((grids, levels, transfers))
}

/// Transport-type problem: functional ||sigma||_M^2 + ||div sigma||_W^2 over
/// the vector field alone.
pub fn transport_problem(
    finest: CartesianGrid,
    num_levels: usize,
    ess: [bool; NUM_BDR_ATTRS],
) -> Result<Problem> {
    let (grids, levels, transfers) = level_stack(finest, num_levels, ess, None)?;
    let grid = &grids[0];

    let mass = grid.hdiv_mass();
    let div = grid.divergence();
    let w = grid.l2_mass();
    let div_t = div.transpose_view().to_csr();
    let div_term = (&div_t * &(&w * &div).to_csr()).to_csr();
    let functional = (&mass.view() + &div_term.view()).to_csr();

    let ess_mask = grid.boundary_face_mask(&ess);
    let functional = eliminate_rows_cols(&functional, &ess_mask);
    let constraint = zero_cols(&div, &ess_mask);

    Ok(Problem {
        functional,
        constraint,
        levels,
        transfers,
        grids,
    })
}

/// Heat-type problem: ||sigma - grad S||_M^2 + ||div sigma||_W^2 +
/// ||grad S||^2 over the vector field and an auxiliary H1 scalar. The
/// scalar must carry an essential condition somewhere or the block is
/// singular.
pub fn heat_problem(
    finest: CartesianGrid,
    num_levels: usize,
    ess: [bool; NUM_BDR_ATTRS],
    ess_h1: [bool; NUM_BDR_ATTRS],
) -> Result<Problem> {
    if !ess_h1.iter().any(|&b| b) {
        return Err(SolverError::Configuration(
            "heat problem needs an essential boundary for the scalar field".into(),
        ));
    }
    let (grids, levels, transfers) = level_stack(finest, num_levels, ess, Some(ess_h1))?;
    let grid = &grids[0];

    let mass = grid.hdiv_mass();
    let div = grid.divergence();
    let w = grid.l2_mass();
    let div_t = div.transpose_view().to_csr();
    let div_term = (&div_t * &(&w * &div).to_csr()).to_csr();
    let a00 = (&mass.view() + &div_term.view()).to_csr();

    let gf = grid.gradient_flux();
    let mg = (&mass * &gf).to_csr();
    let gmg = (&gf.transpose_view().to_csr() * &mg).to_csr();
    let grad = grid.gradient();
    let stiffness = (&grad.transpose_view().to_csr() * &(&grid.edge_mass() * &grad).to_csr()).to_csr();
    let a11 = (&gmg.view() + &stiffness.view()).to_csr();

    let a01 = mg.map(|v| -v);
    let a10 = a01.transpose_view().to_csr();

    let n_hdiv = grid.num_faces();
    let n_h1 = grid.num_vertices();
    let functional = block_matrix(
        &[n_hdiv, n_h1],
        &[n_hdiv, n_h1],
        &[(0, 0, &a00), (0, 1, &a01), (1, 0, &a10), (1, 1, &a11)],
    );

    let ess_mask = grid.boundary_face_mask(&ess);
    let mut block_mask = ess_mask.clone();
    block_mask.extend(grid.boundary_vertex_mask(&ess_h1));
    let functional = eliminate_rows_cols(&functional, &block_mask);
    let constraint = zero_cols(&div, &ess_mask);

    Ok(Problem {
        functional,
        constraint,
        levels,
        transfers,
        grids,
    })
}

/// Particular-solution finder: computes a vector field whose discrete
/// divergence equals `rhs` by solving D D^T y = rhs with pcg and taking
/// x = D^T y. The caller owns judging `info` when the inner solve is cut
/// short.
pub fn particular_solution(
    constraint: &CsrMatrix,
    rhs: &Vector,
    max_iter: usize,
    tolerance: f64,
) -> (Vector, SolveInfo) {
    let d_t = constraint.transpose_view().to_csr();
    let normal = (constraint * &d_t).to_csr();
    let l1 = l1_inverse(&normal);
    let mut precond = |r: &mut Vector| *r *= &l1;

    let zeros = Vector::zeros(constraint.rows());
    let (y, info) = pcg(&normal, rhs, &zeros, max_iter, tolerance, &mut precond);
    if !info.converged {
        warn!(
            "particular solution solve stopped at {} iterations, relative residual {:.3e}",
            info.iterations,
            info.relative_residual()
        );
    }
    (&d_t * &y, info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::random_vec;

    #[test]
    fn complex_is_exact() {
        let grid = CartesianGrid::new(3, 2, 4);
        let div = grid.divergence();
        let curl = grid.curl();
        let grad = grid.gradient();

        let dc = (&div * &curl).to_csr();
        assert!(dc.data().iter().all(|v| v.abs() < 1e-14), "div*curl != 0");

        let cg = (&curl * &grad).to_csr();
        assert!(cg.data().iter().all(|v| v.abs() < 1e-14), "curl*grad != 0");
    }

    #[test]
    fn divergence_commutes_with_embedding() {
        // D_fine * P_hdiv == P_l2 * D_coarse, the commuting diagram that
        // keeps coarse corrections divergence-free after prolongation.
        let coarse = CartesianGrid::cube(2);
        let fine = coarse.refine();

        // The embedded field has piecewise-constant divergence, so the fine
        // cell averages agree with the prolonged coarse ones exactly.
        let lhs = (&fine.divergence() * &coarse.prolongation_hdiv()).to_csr();
        let rhs = (&coarse.prolongation_l2() * &coarse.divergence()).to_csr();

        let diff = (&lhs - &rhs).to_csr();
        assert!(diff.data().iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn curl_embedding_stays_divergence_free() {
        let coarse = CartesianGrid::cube(2);
        let fine = coarse.refine();
        let y = random_vec(coarse.num_edges());
        let coarse_field = &coarse.curl() * &y;
        let fine_field = &coarse.prolongation_hdiv() * &coarse_field;
        let fine_div = &fine.divergence() * &fine_field;
        assert!(fine_div.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn l2_prolongation_preserves_constants() {
        let coarse = CartesianGrid::cube(2);
        let p = coarse.prolongation_l2();
        let ones = Vector::from(vec![1.0; p.cols()]);
        let result = &p * &ones;
        assert!(result.iter().all(|v| (v - 1.0).abs() < 1e-14));
    }

    #[test]
    fn galerkin_mass_matches_direct_assembly() {
        // The prolongation is the exact embedding, so the Galerkin coarse
        // Gram matrix equals the directly assembled coarse mass.
        let coarse = CartesianGrid::cube(2);
        let fine = coarse.refine();
        let p = coarse.prolongation_hdiv();
        let pt = p.transpose_view().to_csr();
        let galerkin = (&pt * &(&fine.hdiv_mass() * &p).to_csr()).to_csr();
        let direct = coarse.hdiv_mass();

        let gd = galerkin.to_dense();
        let dd = direct.to_dense();
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
    fn particular_solution_satisfies_constraint() {
        let grid = CartesianGrid::cube(4);
        let div = grid.divergence();
        // A compatible rhs: the divergence of some field.
        let field = random_vec(grid.num_faces());
        let rhs = &div * &field;

        let (x, info) = particular_solution(&div, &rhs, 500, 1e-12);
        assert!(info.converged);
        let achieved = &div * &x;
        let err = &achieved - &rhs;
        let rel = err.t().dot(&err).sqrt() / rhs.t().dot(&rhs).sqrt();
        assert!(rel < 1e-8, "relative constraint error {rel}");
    }

    #[test]
    fn stack_rejects_odd_grids() {
        let err = level_stack(CartesianGrid::cube(6), 3, [false; 6], None);
        assert!(err.is_err());
    }
}
