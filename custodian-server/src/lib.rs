//! Backup orchestration core: catalog records, the schedule engine, task
//! execution, archive retention, the scheduler loop and the agent transport.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod timespec;
pub mod ws;
