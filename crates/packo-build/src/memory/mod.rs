//! In-process backend.
//!
//! [`MemoryStore`] and [`MemoryLogSource`] implement the capability traits
//! without a cluster; [`SimulatedController`] plays the part of the remote
//! build controller by reacting to new requests with build attempts. Used by
//! the local CLI backend and as test doubles.

mod controller;
mod logs;
mod store;

pub use controller::SimulatedController;
pub use logs::MemoryLogSource;
pub use store::MemoryStore;
