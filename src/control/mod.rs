//! HTTP control plane

pub mod handlers;
pub mod server;

pub use server::ControlServer;
