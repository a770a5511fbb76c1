// Public API for integration tests and embedding

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod tcp;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod ws;
