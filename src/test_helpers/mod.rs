//! Shared fixtures for unit tests.

mod fixtures;
mod target;
mod temp;

pub use fixtures::PackageBuilder;
pub use target::SimulatedTarget;
pub use temp::TestContext;
