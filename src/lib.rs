//! ingressd - keeps a reverse proxy's virtual hosts in sync with backend descriptors
//!
//! This library provides a reconciliation daemon that:
//! - Loads one backend entry per descriptor file at startup
//! - Resolves each backend's address (static `backend.ip` or DNS with a timeout)
//! - Renders a configuration fragment per entry from a MiniJinja template
//! - Re-renders an entry only when its address, activity or watched files change
//! - Coalesces all fragment changes between two polls into a single validated reload
//! - Supervises the proxy process and stops when it dies

pub mod config;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod reconcile;
pub mod render;
pub mod resolver;
pub mod supervisor;
