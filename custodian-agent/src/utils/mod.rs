pub mod errors;
pub mod logger;

pub use errors::{AgentError, Result};
