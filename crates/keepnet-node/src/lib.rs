//! keepnet Node Library
//!
//! This library provides the node side of the keepnet storage network:
//! configuration, identity, role handlers, and DHT startup over TCP.

pub mod config;
pub mod node;
pub mod roles;

pub use config::Config;
pub use node::{start_client, start_node, Node};
pub use roles::{Caller, Role, RoleHandler};
