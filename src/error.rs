//! Error taxonomy for hierarchy construction and the multilevel solvers.
//!
//! Setup-time problems (mismatched operator dimensions, bad level indices)
//! and numerically singular patch systems abort the whole solve; there is no
//! meaningful partial result once they occur. Non-convergence is not an
//! error and is reported through [`crate::solver::SolveInfo`] instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    /// Malformed hierarchy or solver configuration, detected at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A level or space index outside the hierarchy.
    #[error("level {level} out of range for {what} ({levels} levels)")]
    OutOfRange {
        level: usize,
        levels: usize,
        what: &'static str,
    },

    /// A patch saddle-point matrix failed to factorize. Indicates a broken
    /// agglomeration, not a transient condition.
    #[error("singular local system on level {level}, patch {patch}")]
    SingularLocalSystem { level: usize, patch: usize },

    /// The running iterate drifted off the constraint manifold beyond
    /// tolerance. Only raised in strict mode; otherwise logged.
    #[error("constraint violated: relative residual {residual:.3e} exceeds {tolerance:.3e}")]
    ConstraintViolation { residual: f64, tolerance: f64 },
}

pub type Result<T> = std::result::Result<T, SolverError>;
