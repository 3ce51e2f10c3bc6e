//! codemend library crate
//!
//! Exposes the repair pipeline so integration tests and external tooling can
//! drive it without going through CLI startup.

pub mod classify;
pub mod config;
pub mod controller;
pub mod extract;
pub mod ollama;
pub mod patch;
pub mod report;
pub mod sandbox;
pub mod util;
pub mod verify;
