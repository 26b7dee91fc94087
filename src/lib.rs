//! VPC CNI plugin for Kubernetes
//!
//! This implementation provides a pure Rust CNI plugin that:
//! - Allocates pod addresses from the secondary addresses of the host's ENIs
//! - Keeps allocations in a crash-safe, lock-protected on-disk store
//! - Wires a veth pair between the host and the container namespace
//! - Installs source-based policy routing so pod traffic leaves via the owning ENI

pub mod allocator;
pub mod commands;
pub mod config;
pub mod eni;
pub mod ip;
pub mod plugin;
pub mod routing;
pub mod store;
pub mod types;
pub mod wiring;

// Re-export commonly used items
pub use allocator::Allocator;
pub use commands::{run_cni, cmd_add, cmd_del, cmd_check};
pub use config::NetConf;
pub use eni::EniPool;
pub use plugin::VpcNetPlugin;
pub use store::{AllocationRecord, Store};
