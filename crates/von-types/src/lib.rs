//! Core types for the Voronoi overlay network (VON).
//!
//! This crate defines the identities, positions, configuration and errors
//! shared by the wire protocol and the node binary. It contains no I/O.

pub mod address;
pub mod config;
pub mod error;
pub mod identity;
pub mod vec2;

pub use address::{Address, DEFAULT_PORT};
pub use config::{ForwardRule, LogConfig, NodeConfig, ProtocolConfig};
pub use error::{VonError, VonResult};
pub use identity::Identity;
pub use vec2::Vec2;
