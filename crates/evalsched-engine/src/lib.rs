//! Job-matrix scheduling core for model evaluations.
//!
//! The engine turns a set of model references, task names, and shot counts
//! (or an explicit table of them) into a single Slurm array job. A scheduling
//! run proceeds strictly in order:
//!
//! 1. [`ArtifactStore::ensure`] makes sure the shared container image exists.
//! 2. [`JobMatrixBuilder::build`] resolves models and forms the work matrix.
//! 3. [`QueueMonitor::snapshot`] reads the caller's current queue load.
//! 4. [`decide`] compares that load with the configured ceiling.
//! 5. [`ArraySubmitter::submit`] persists the matrix and submits the array.
//!
//! [`Scheduler`] ties these together.

pub mod artifact;
pub mod capacity;
pub mod config;
mod lock;
pub mod matrix;
pub mod prefetch;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod submit;

pub use artifact::ArtifactError;
pub use artifact::ArtifactStore;
pub use artifact::ImageReference;
pub use capacity::CapacityDecision;
pub use capacity::decide;
pub use config::Config;
pub use config::ConfigError;
pub use matrix::EvalJobRow;
pub use matrix::JobMatrix;
pub use matrix::JobMatrixBuilder;
pub use matrix::MatrixError;
pub use matrix::MatrixInput;
pub use queue::QueueMonitor;
pub use queue::QueueSnapshot;
pub use resolver::ModelReference;
pub use resolver::ModelResolver;
pub use resolver::ResolvedModel;
pub use scheduler::Outcome;
pub use scheduler::ScheduleError;
pub use scheduler::ScheduleRequest;
pub use scheduler::Scheduler;
pub use submit::ArraySubmitter;
pub use submit::SubmissionResult;
pub use submit::SubmitError;
