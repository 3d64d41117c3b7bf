//! Implementation of evalsched CLI commands.

pub mod completions;
pub mod config;
pub mod schedule;
