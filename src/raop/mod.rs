//! RAOP (AirPlay 1) session handling
//!
//! The wire protocol itself lives in an external client library; this
//! module defines the seam ([`client`]), the native adapter behind the
//! `libraop` feature ([`ffi`]), and the per-speaker session state machine
//! ([`hostage`]).

pub mod client;
#[cfg(feature = "libraop")]
pub mod ffi;
pub mod hostage;

pub use client::{ClientParams, Crypto, RaopClient, RaopClientFactory};
pub use hostage::RaopHostage;

use std::sync::Arc;

/// The factory used for real speaker connections.
#[cfg(feature = "libraop")]
pub fn default_factory() -> Arc<dyn RaopClientFactory> {
    Arc::new(ffi::LibraopFactory)
}

/// Without the native library, connections are refused and groups run
/// DEGRADED. See DESIGN.md.
#[cfg(not(feature = "libraop"))]
pub fn default_factory() -> Arc<dyn RaopClientFactory> {
    Arc::new(client::DisabledFactory)
}
