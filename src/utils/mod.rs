//! Shared helpers.

pub mod json_path;
