//! # airroom
//!
//! Multi-room AirPlay bridge.
//!
//! The bridge discovers RAOP (AirPlay 1) speakers on the local network,
//! lets an operator form named groups of them, spawns one AirPlay 2
//! receiver process per group, and fans the received PCM out in real time
//! to every member speaker over RAOP sessions it keeps open ("hostages").
//!
//! ## Architecture Overview
//!
//! ```text
//!  mDNS (_raop._tcp)                    AirPlay source (phone, Mac, ...)
//!        │                                        │
//!        ▼                                        ▼
//!  ┌───────────┐  snapshots   ┌─────────────────────────────────────┐
//!  │ Discovery ├─────────────▶│ AppState (single mutex)             │
//!  └───────────┘              │   speaker registry   group map      │
//!                             └──────────┬──────────────┬───────────┘
//!                                        │              │
//!                     per group          │              │
//!  ┌─────────────────┐  raw PCM   ┌──────▼─────┐  ┌─────▼──────┐
//!  │ ReceiverProcess ├───────────▶│   Ingest   │  │  Streamer  │
//!  │ (shairport-sync │  callback  │ re-chunker │  │    loop    │
//!  │  in own netns)  │            └──────┬─────┘  └─────┬──────┘
//!  └─────────────────┘                   │ 1408-byte    │ chunks
//!                                        ▼ chunks       ▼
//!                                  bounded queue   RaopHostage × N
//!                                  (drop oldest)   (connect, keep-alive,
//!                                                   send, reconnect)
//! ```
//!
//! The streamer synthesizes silence chunks while the queue is empty so the
//! RAOP sessions stay claimed between songs; a heartbeat task pulses every
//! hostage with keep-alives.

pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod group;
pub mod raop;
pub mod receiver;
pub mod secrets;
pub mod state;

pub use error::{Error, Result};

/// Audio pipeline constants shared by the receiver callback and the
/// streamer loop.
pub mod constants {
    /// Bytes per PCM frame (16-bit signed stereo).
    pub const BYTES_PER_FRAME: usize = 4;

    /// Frames per RAOP chunk (the RAOP default).
    pub const FRAMES_PER_CHUNK: usize = 352;

    /// Bytes per chunk handed to a hostage.
    pub const CHUNK_BYTES: usize = BYTES_PER_FRAME * FRAMES_PER_CHUNK;

    /// Upper bound on queued chunks per group (~0.14 s of headroom).
    /// Overflow drops the oldest chunk.
    pub const MAX_QUEUED_CHUNKS: usize = 16;

    /// Source sample rate. The receiver emits 16-bit stereo at this rate.
    pub const SAMPLE_RATE: u32 = 44_100;

    /// First port handed to a group's receiver instance.
    pub const BASE_GROUP_PORT: u16 = 6000;

    /// Exclusive upper bound of the group port range.
    pub const MAX_GROUP_PORT: u16 = 20_000;
}
