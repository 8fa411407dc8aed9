pub mod access;
pub mod app;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod rooms;
pub mod server;
pub mod ws;

pub use server::{RelayServer, SHUTDOWN_DRAIN_TIMEOUT};
