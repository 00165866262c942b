mod routes;

pub mod app;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod detector;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use app::{start_app, App};
