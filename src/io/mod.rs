//! File formats crossed at the engine boundary.

pub mod export;
pub mod reports;
pub mod shapes;
