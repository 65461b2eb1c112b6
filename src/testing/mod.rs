//! Test-only support shared by unit tests and integration tests: a fake
//! archive, filesystem fixtures, and an ephemeral in-process engine.

pub mod ephemeral;
pub mod fixtures;
pub mod mock;

pub use ephemeral::Harness;
