//! Shared helpers for the lead pipeline integration tests.

pub mod fixtures;
pub mod mocks;
pub mod setup;
