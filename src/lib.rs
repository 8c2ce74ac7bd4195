//! Library crate for lan-watch-rs: continuous LAN discovery, half-open port
//! probing, and a persistent host registry.
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod netdetect;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;
