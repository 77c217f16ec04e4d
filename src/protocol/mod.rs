//! Protocol module - engine facade and orchestration.
//!
//! This module provides the engine that composes the accounting components
//! with the external collaborators and executes every operation atomically.

pub mod engine;
pub mod events;
pub mod operations;

pub use engine::*;
pub use events::*;
pub use operations::*;
