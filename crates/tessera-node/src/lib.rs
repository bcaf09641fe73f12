//! Tessera node.
//!
//! [`Node`] wires the storage, Merkle clock, update bus and replicator of
//! one peer together and exposes them as document reads and writes plus
//! peer session management. [`NodeConfig`] holds its options and loads
//! from TOML.

pub mod config;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use node::Node;
