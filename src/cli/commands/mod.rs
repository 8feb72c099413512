//! CLI command implementations.

pub mod paper;
pub mod strategies;
pub mod validate;
