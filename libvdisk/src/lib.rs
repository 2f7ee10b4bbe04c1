//! Disk imaging primitives used by the vdm mount helper.
//!
//! Everything that touches the operating system's virtual disk facilities sits behind
//! [`DiskImaging`]; the overlay and guard modules only ever talk to that trait, so the
//! helper state machine can run against the simulated backend in tests.

pub mod backend;
pub mod command;
pub mod error;
pub mod guard;
pub mod overlay;

pub use backend::{DiskImaging, Volume};
pub use error::ImagingError;
