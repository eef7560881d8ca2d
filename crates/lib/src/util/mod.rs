//! Small shared utilities.

pub mod hash;
pub mod paths;
