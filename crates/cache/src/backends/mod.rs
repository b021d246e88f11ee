//! Cache backend implementations.

pub mod memory;
pub mod redis;
