//! CLI command implementations.

pub mod encode;
pub mod hex_utils;
pub mod info;
pub mod patterns;
pub mod scan;
