//! Core building blocks of the accounting engine.
//!
//! - Configuration and policy parameters
//! - Position records and the reconciled view
//! - Collateral and debt accounting pools
//! - External collaborator interfaces

pub mod config;
pub mod interfaces;
pub mod pools;
pub mod position;

pub use config::*;
pub use interfaces::*;
pub use pools::*;
pub use position::*;
