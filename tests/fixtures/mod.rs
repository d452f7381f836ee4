//! Test fixtures

pub mod overlay;

pub use overlay::{Overlay, Recorder};
