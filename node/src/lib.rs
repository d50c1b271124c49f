#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod cli;
pub mod config;
pub mod node;
pub mod tasks;
pub mod transport;

pub mod test_utils;

pub use config::NodeConfig;
pub use node::{NodeStatus, RegistryNode};
pub use tasks::Supervisor;
pub use transport::HttpPeerTransport;
