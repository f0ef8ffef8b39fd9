//! ls3d Core Library
//!
//! This crate provides the math types, the axis convention bridge and the
//! unified error type shared by the 4DS codec and the scene layer.

pub mod error;
pub mod types;

pub use error::{Error, Result, ResultExt};
pub use types::*;

/// Re-export commonly used items
pub mod prelude {
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::types::*;
}
