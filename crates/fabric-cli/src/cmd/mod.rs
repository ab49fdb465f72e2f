//! Command implementations by domain.

pub mod codec;
pub mod node;
