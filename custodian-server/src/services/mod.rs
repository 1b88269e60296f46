pub mod engine;
pub mod retention;
pub mod scheduler;
pub mod transport;
