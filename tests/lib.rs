//! Shared fixtures and helpers for the Tether integration tests.

pub mod fixtures;
pub mod test_helpers;
