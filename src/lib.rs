pub mod api;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod genome;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod store;
pub mod tools;
pub mod transport;
pub mod world;
