//! berth-store — persisted resource bookkeeping for the berth control plane.
//!
//! Owns everything that must stay consistent across process restarts: the
//! set of tracked workload UUIDs, the UUID→lifecycle-state map, per-workload
//! container metadata (image id, container id, port), the port allocation
//! table, and the append-only audit log.
//!
//! All in-memory maps live behind a single mutex inside [`ResourceStore`];
//! every read-modify-write sequence (UUID rejection sampling, port
//! allocation, compare-and-swap state advances) runs under that lock.
//! Writes are persisted to disk synchronously before the lock is released.

pub mod error;
pub mod layout;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use layout::WorkspaceLayout;
pub use store::{ImageData, ResourceStore, UNSET_ID, UNSET_PORT};
