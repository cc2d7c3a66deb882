//! buildmedic library crate
//!
//! Diagnoses failed builds, applies guarded fixes with rollback, verifies
//! them by rebuilding, and remembers what worked. The CLI in `main.rs` is a
//! thin layer over [`recovery::Recovery`].

pub mod collab;
pub mod config;
pub mod diagnose;
pub mod fix;
pub mod history;
pub mod logging;
pub mod project;
pub mod recovery;
pub mod rollback;
pub mod sandbox;
pub mod session;
pub mod util;
