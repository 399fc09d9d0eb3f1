//! Parallel implementations of the sparse kernels the cycle leans on.
//! These need to be fast; everything else can go through `sprs` operators.

use rayon::prelude::*;

use crate::{CsrMatrix, Vector};

pub fn spmv(a: &CsrMatrix, b: &Vector) -> Vector {
    assert!(a.is_csr());
    assert_eq!(a.cols(), b.len());
    let c: Vec<f64> = (0..a.rows())
        .into_par_iter()
        .map(|i| {
            let row = a.outer_view(i).unwrap();
            row.iter().map(|(j, val)| b[j] * val).sum::<f64>()
        })
        .collect();
    Vector::from(c)
}

/// y = b - A*x, the residual update inside every level visit.
pub fn residual(a: &CsrMatrix, x: &Vector, b: &Vector) -> Vector {
    assert_eq!(a.rows(), b.len());
    let ax = spmv(a, x);
    b - &ax
}
