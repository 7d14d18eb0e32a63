//! berth-container — containerization of compiled workloads.
//!
//! [`engine::ContainerEngine`] is the seam to the container runtime; the
//! production implementation drives the Docker daemon through bollard.
//! [`worker::ContainerWorker`] runs build, start and stop on a bounded
//! async pool and owns the at-most-one-live-container-per-workload
//! invariant.

pub mod engine;
pub mod worker;

pub use engine::{ContainerEngine, DockerEngine, EngineError, EngineResult};
pub use worker::{ContainerWorker, WorkerError};
