//! Errors that abort a measurement before any iteration.
//!
//! Per-object measurement problems never show up here; they are reported through
//! [`FitFlags`](crate::FitFlags) on the returned result.

use thiserror::Error;

/// Fatal configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MomentsError {
    /// The initial center is NaN or infinite.
    #[error("initial center ({x}, {y}) is not finite")]
    NonFiniteCenter {
        /// Column of the rejected center.
        x: f64,
        /// Row of the rejected center.
        y: f64,
    },
    /// The iteration cap must allow at least one iteration.
    #[error("max_iter must be positive")]
    ZeroMaxIter,
    /// A numeric option is NaN or outside its allowed range.
    #[error("option {name} = {value} is out of range")]
    InvalidOption {
        /// Name of the offending option.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },
}
