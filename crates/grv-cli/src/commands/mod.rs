//! Subcommand implementations.

pub mod review;
pub mod serve;
