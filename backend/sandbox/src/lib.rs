//! Sandbox runtime adapters.
//!
//! `DockerRuntime` drives the container engine through its CLI with every
//! call bounded by a timeout. `InMemoryRuntime` implements the same state
//! machine in-process for tests and local development.

pub mod docker;
pub mod memory;
pub mod parse;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use memory::{InMemoryRuntime, RuntimeOp};
