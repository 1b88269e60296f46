//! Custodian agent: runs plugin commands for a remote custodian server.

pub mod api;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod utils;
pub mod ws;

pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
