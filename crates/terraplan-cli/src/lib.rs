//! Helpers shared by the `terraplan` command-line tool.

pub mod input;
pub mod runtime;
