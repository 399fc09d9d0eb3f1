//! Multilevel solvers for divergence-constrained minimization problems.
//!
//! <br>
//!
//! The systems targeted here come from constrained first-order least-squares
//! (CFOSLS) discretizations of space-time transport, heat, and wave problems:
//! minimize a symmetric positive semi-definite quadratic functional over a
//! vector field (plus an optional auxiliary scalar field) subject to the
//! linear constraint that its discrete divergence equals a prescribed
//! right-hand side. Krylov methods on the associated saddle-point system
//! converge poorly and standard multigrid ignores the constraint, so this
//! crate implements a multigrid-like iteration that never leaves the
//! constraint manifold: the iterate starts from a particular solution of the
//! divergence equation and every correction is divergence-free by
//! construction.
//!
//! The moving parts are a nested [`hierarchy::Hierarchy`] of discretization
//! levels with exact inter-level embeddings, a patch-wise Schwarz solver
//! ([`local::LocalSolver`]) solving small dense saddle-point systems on
//! element agglomerates, a relaxation in the divergence-free subspace reached
//! through a discrete curl operator ([`smoother::DivFreeSmoother`]), and an
//! exact solve at the coarsest level ([`coarse::CoarsestSolver`]). The
//! orchestration lives in [`minimize::MinimizationSolver`].

use ndarray::{Array1, Array2};
use sprs::{CsMatBase, TriMatBase};
use sprs_ldl::LdlNumeric;

#[macro_use]
extern crate log;
extern crate approx;

pub mod assembly;
pub mod coarse;
pub mod error;
pub mod hierarchy;
pub mod local;
pub mod minimize;
pub mod parallel_ops;
pub mod smoother;
pub mod solver;
pub mod utils;

pub type CsrMatrix = CsMatBase<f64, usize, Vec<usize>, Vec<usize>, Vec<f64>, usize>;
pub type CooMatrix = TriMatBase<Vec<usize>, Vec<f64>>;
pub type Vector = Array1<f64>;
pub type Matrix = Array2<f64>;
pub type Cholesky = LdlNumeric<f64, usize>;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use lazy_static::lazy_static;

// Lazily-initialised output directory for solve reports.
lazy_static! {
    static ref OUTPUT_DIR: PathBuf = {
        let base = Path::new("./output");
        fs::create_dir_all(base).expect("Failed to create base output directory");
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S").to_string();
        for suffix in 0u32.. {
            let candidate = if suffix == 0 {
                base.join(&ts)
            } else {
                base.join(format!("{}_{}", ts, suffix))
            };

            if !candidate.exists() {
                fs::create_dir_all(&candidate).expect("Failed to create unique output directory");
                return candidate;
            }
        }
        unreachable!("u32 exhausted while searching for unique directory name")
    };
}

/// Helper to build paths inside the output directory.
pub fn output_path<S: AsRef<Path>>(file: S) -> PathBuf {
    OUTPUT_DIR.join(file)
}
