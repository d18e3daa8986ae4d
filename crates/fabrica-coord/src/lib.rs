//! Fabrica Coordination - cluster coordination primitive
//!
//! The engine consumes a narrow coordination contract: named locks with
//! TTL, a key/value cache with TTL, and a publish/subscribe channel. This
//! crate defines that contract and ships an in-process implementation for
//! single-node deployments and tests. Clustered deployments plug in an
//! external implementation (Redis, etcd, ...) behind the same trait.

pub mod coordinator;
pub mod local;

// Re-exports
pub use coordinator::{Coordinator, Payload, Subscription};
pub use local::LocalCoordinator;
