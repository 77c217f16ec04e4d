//! Utility modules shared across the engine.
//!
//! - Identity and hashing primitives
//! - Fixed-point arithmetic
//! - Constants

pub mod constants;
pub mod crypto;
pub mod math;

pub use constants::*;
pub use crypto::*;
pub use math::*;
