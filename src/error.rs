//! Error types for the bridge

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("RAOP error: {0}")]
    Raop(#[from] RaopError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// mDNS discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon creation failed: {0}")]
    DaemonInit(String),

    #[error("mDNS browse failed: {0}")]
    BrowseFailed(String),

    #[error("Discovery already running")]
    AlreadyRunning,
}

/// RAOP session errors
#[derive(Error, Debug)]
pub enum RaopError {
    #[error("Invalid speaker address: {0}")]
    InvalidAddress(String),

    #[error("Speaker unreachable: {0}")]
    Unreachable(String),

    #[error("RAOP client creation failed for {0}")]
    ClientInit(String),

    #[error("RAOP connect failed for {0}")]
    ConnectFailed(String),

    #[error("Chunk length {0} is not a multiple of the frame size")]
    UnalignedChunk(usize),
}

/// Receiver process errors
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Receiver binary not found in any candidate path")]
    BinaryNotFound,

    #[error("Network namespace setup failed: {0}")]
    NamespaceSetup(String),

    #[error("Failed to spawn receiver: {0}")]
    SpawnFailed(String),

    #[error("Receiver is already running")]
    AlreadyRunning,
}

/// Group lifecycle errors
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("Group name is empty")]
    EmptyName,

    #[error("Group already exists: {0}")]
    AlreadyExists(String),

    #[error("Group not found: {0}")]
    NotFound(String),

    #[error("No speakers selected")]
    NoMembers,

    #[error("Speaker unavailable: {0}")]
    SpeakerUnavailable(String),

    #[error("No free ports available")]
    NoFreePort,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
