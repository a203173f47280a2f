//! Per-group AirPlay 2 receiver process
//!
//! Each group runs its own `shairport-sync` instance inside a dedicated
//! network namespace with a macvlan link, so every group advertises a
//! distinct AirPlay 2 identity on the LAN. The parent captures the
//! receiver's stdout PCM stream.

pub mod netns;
pub mod process;

pub use netns::NetNamespace;
pub use process::ReceiverProcess;
