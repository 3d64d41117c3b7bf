//! The evalsched command line tool.
//!
//! Schedules batches of model evaluations on a Slurm cluster as a single
//! array job. The scheduling itself lives in [`evalsched_engine`]; this crate
//! provides configuration loading and the command line interface.

pub mod commands;
pub mod config;
