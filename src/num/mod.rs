//! Numeric primitives: fixed-point arithmetic and rolling windows.

pub mod fixed;
pub mod rolling;

pub use fixed::{median, FixedPoint, StatAccumulator};
pub use rolling::RollingWindow;
