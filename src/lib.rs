//! Medley worker-process library root.
//!
//! CPU-heavy and crash-prone jobs (feed parsing, tag extraction, media
//! probing) run in a separate `medley-workerd` process so the player's main
//! process stays responsive. The [`service`] module is the main-process side;
//! the [`worker`] module is what runs inside the spawned process.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod error;
pub mod ipc;
pub mod protocol;
pub type Result<T> = error::MedleyResult<T>;

pub mod service;
pub mod worker;
