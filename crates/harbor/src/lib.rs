//! Harbor - plugin host
//!
//! This crate provides the host runtime:
//! - Plugin archive discovery and validation (`loader`)
//! - Process-isolated plugin execution over a framed stdio protocol (`sandbox`)
//! - Lifecycle state and the capability routing table (`registry`)
//! - Control plane and data plane HTTP routers (`gateway`)
//! - Periodic and file-watch driven rescans (`scanner`)

pub mod config;
pub mod gateway;
pub mod loader;
pub mod registry;
pub mod sandbox;
pub mod scanner;

mod types;

pub use types::*;
