pub mod config;
pub mod core;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod protocol;
pub mod provision;
pub mod runner;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod store;
