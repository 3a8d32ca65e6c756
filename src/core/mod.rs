//! Pylon Protocol - Core Layer
//!
//! Constants, error types, and the cipher seam shared by every other layer.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
