//! General utilities that don't have a specific home.

use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::{CooMatrix, CsrMatrix, Vector};

pub fn random_vec(size: usize) -> Vector {
    Vector::random(size, Uniform::new(-2.0_f64, 2.0_f64))
}

/// Energy norm sqrt(v^T A v). Asserts on NaN since a NaN here always means
/// an indefinite matrix slipped in upstream.
pub fn norm(vec: &Vector, mat: &CsrMatrix) -> f64 {
    let temp = mat * vec;
    let temp = vec.t().dot(&temp).sqrt();
    assert!(!temp.is_nan());
    temp
}

pub fn inner_product(vec_left: &Vector, vec_right: &Vector, mat: &CsrMatrix) -> f64 {
    let workspace = mat * vec_right;
    vec_left.t().dot(&workspace)
}

pub fn euclidean_norm(vec: &Vector) -> f64 {
    vec.t().dot(vec).sqrt()
}

/// Zero the entries flagged by `mask`. Used to keep corrections away from
/// essential boundary dofs.
pub fn zero_masked(vec: &mut Vector, mask: &[bool]) {
    assert_eq!(vec.len(), mask.len());
    for (v, flagged) in vec.iter_mut().zip(mask.iter()) {
        if *flagged {
            *v = 0.0;
        }
    }
}

/// Rebuild `mat` with the flagged rows zeroed out.
pub fn zero_rows(mat: &CsrMatrix, mask: &[bool]) -> CsrMatrix {
    assert_eq!(mat.rows(), mask.len());
    let mut out = CooMatrix::new((mat.rows(), mat.cols()));
    for (i, row) in mat.outer_iterator().enumerate() {
        if mask[i] {
            continue;
        }
        for (j, val) in row.iter() {
            out.add_triplet(i, j, *val);
        }
    }
    out.to_csr()
}

/// Rebuild `mat` with the flagged columns zeroed out.
pub fn zero_cols(mat: &CsrMatrix, mask: &[bool]) -> CsrMatrix {
    assert_eq!(mat.cols(), mask.len());
    let mut out = CooMatrix::new((mat.rows(), mat.cols()));
    for (i, row) in mat.outer_iterator().enumerate() {
        for (j, val) in row.iter() {
            if !mask[j] {
                out.add_triplet(i, j, *val);
            }
        }
    }
    out.to_csr()
}

/// Zero the flagged rows and columns and put a unit entry on the flagged
/// diagonal, decoupling essential dofs from the interior.
pub fn eliminate_rows_cols(mat: &CsrMatrix, mask: &[bool]) -> CsrMatrix {
    assert_eq!(mat.rows(), mat.cols());
    assert_eq!(mat.rows(), mask.len());
    let mut out = CooMatrix::new((mat.rows(), mat.cols()));
    for (i, row) in mat.outer_iterator().enumerate() {
        if mask[i] {
            out.add_triplet(i, i, 1.0);
            continue;
        }
        for (j, val) in row.iter() {
            if !mask[j] {
                out.add_triplet(i, j, *val);
            }
        }
    }
    out.to_csr()
}

/// Assemble a sparse block matrix from its nonzero blocks. `row_sizes` and
/// `col_sizes` give the block grid; `blocks` lists (block row, block col,
/// matrix) entries.
pub fn block_matrix(
    row_sizes: &[usize],
    col_sizes: &[usize],
    blocks: &[(usize, usize, &CsrMatrix)],
) -> CsrMatrix {
    let row_offsets: Vec<usize> = std::iter::once(0)
        .chain(row_sizes.iter().scan(0, |acc, s| {
            *acc += s;
            Some(*acc)
        }))
        .collect();
    let col_offsets: Vec<usize> = std::iter::once(0)
        .chain(col_sizes.iter().scan(0, |acc, s| {
            *acc += s;
            Some(*acc)
        }))
        .collect();

    let mut out = CooMatrix::new((
        *row_offsets.last().unwrap(),
        *col_offsets.last().unwrap(),
    ));
    for &(bi, bj, mat) in blocks {
        assert_eq!(mat.rows(), row_sizes[bi]);
        assert_eq!(mat.cols(), col_sizes[bj]);
        for (i, row) in mat.outer_iterator().enumerate() {
            for (j, val) in row.iter() {
                out.add_triplet(row_offsets[bi] + i, col_offsets[bj] + j, *val);
            }
        }
    }
    out.to_csr()
}

/// Diagonal of a square sparse matrix as a dense vector.
pub fn diagonal(mat: &CsrMatrix) -> Vector {
    assert_eq!(mat.rows(), mat.cols());
    let mut diag = Vector::zeros(mat.rows());
    for (i, row) in mat.outer_iterator().enumerate() {
        for (j, val) in row.iter() {
            if i == j {
                diag[i] = *val;
            }
        }
    }
    diag
}

pub fn format_duration(duration: &std::time::Duration) -> String {
    let seconds = duration.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let minutes = minutes % 60;
    let seconds = seconds % 60;

    format!("{} hours, {} minutes, {} seconds", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use sprs::TriMat;

    fn small_mat() -> CsrMatrix {
        let mut m = TriMat::new((3, 3));
        m.add_triplet(0, 0, 2.0);
        m.add_triplet(0, 1, -1.0);
        m.add_triplet(1, 0, -1.0);
        m.add_triplet(1, 1, 2.0);
        m.add_triplet(2, 2, 3.0);
        m.to_csr()
    }

    #[test]
    fn eliminate_decouples() {
        let mat = small_mat();
        let out = eliminate_rows_cols(&mat, &[false, true, false]);
        let dense = out.to_dense();
        assert_eq!(dense[[1, 1]], 1.0);
        assert_eq!(dense[[0, 1]], 0.0);
        assert_eq!(dense[[1, 0]], 0.0);
        assert_eq!(dense[[0, 0]], 2.0);
        assert_eq!(dense[[2, 2]], 3.0);
    }

    #[test]
    fn energy_norm_matches_hand_computation() {
        let mat = small_mat();
        let v = Vector::from(vec![1.0, 1.0, 1.0]);
        // v^T A v = 2 - 1 - 1 + 2 + 3 = 5
        assert_abs_diff_eq!(norm(&v, &mat), 5.0_f64.sqrt(), epsilon = 1e-14);
    }
}
