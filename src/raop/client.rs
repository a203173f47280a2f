//! RAOP client seam
//!
//! The actual RTSP/RTP implementation is an external library. Everything
//! above it talks to these traits, which mirror the library's C surface
//! one-to-one so the adapter stays thin. Calls return plain booleans the
//! way the library reports them; the hostage layer turns those into logs
//! and reconnect decisions.

use std::net::Ipv4Addr;

/// Payload encryption mode negotiated with a speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crypto {
    Clear,
    Rsa,
}

/// Audio codec announced to the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Alac,
}

/// Parameters for creating one client session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientParams {
    pub codec: Codec,
    pub frames_per_chunk: usize,
    pub sample_rate: u32,
    pub sample_size: u8,
    pub channels: u8,
    pub crypto: Crypto,
    /// Run the FairPlay auth-setup exchange during connect.
    pub auth: bool,
    /// Encryption-type token string forwarded to the library, if any.
    pub et: Option<String>,
}

impl ClientParams {
    /// The bridge's fixed audio geometry: ALAC, 352-frame chunks, 44.1 kHz
    /// 16-bit stereo.
    pub fn standard(crypto: Crypto, auth: bool, et: Option<String>) -> Self {
        Self {
            codec: Codec::Alac,
            frames_per_chunk: crate::constants::FRAMES_PER_CHUNK,
            sample_rate: crate::constants::SAMPLE_RATE,
            sample_size: 16,
            channels: 2,
            crypto,
            auth,
            et,
        }
    }
}

/// One live protocol session with a speaker.
pub trait RaopClient: Send {
    /// Establish the RTSP session. `set_volume` pushes the default volume
    /// during setup.
    fn connect(&mut self, host: Ipv4Addr, port: u16, set_volume: bool) -> bool;

    /// Tear the session down. Idempotent.
    fn disconnect(&mut self);

    /// Issue a keep-alive on the control channel.
    fn keepalive(&mut self) -> bool;

    /// Whether the library has room for another audio chunk right now.
    fn accept_frames(&mut self) -> bool;

    /// Send one PCM chunk. `playtime` is advanced by the library.
    fn send_chunk(&mut self, pcm: &[u8], frames: usize, playtime: &mut u64) -> bool;

    /// Apply a playback volume in `[0.0, 1.0]`.
    fn set_volume(&mut self, volume: f32) -> bool;
}

/// Creates client sessions; one factory is shared by all hostages.
pub trait RaopClientFactory: Send + Sync {
    /// Create a session with the given parameters, or `None` when the
    /// library refuses (treated as a failed connection attempt).
    fn create(&self, params: &ClientParams) -> Option<Box<dyn RaopClient>>;
}

/// Factory used when the crate is built without the `libraop` feature:
/// every creation attempt is refused, so hostages stay disconnected and
/// groups report DEGRADED instead of silently faking a transport.
pub struct DisabledFactory;

impl RaopClientFactory for DisabledFactory {
    fn create(&self, _params: &ClientParams) -> Option<Box<dyn RaopClient>> {
        tracing::warn!(
            target: "libraop",
            "RAOP client library not compiled in (enable the `libraop` feature)"
        );
        None
    }
}

#[cfg(test)]
pub mod mock {
    //! Scriptable in-memory client used by the unit tests across modules.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Knobs controlling how mock sessions behave. Shared with the test so
    /// behavior can change mid-run.
    pub struct MockBehavior {
        pub connect_ok: bool,
        pub keepalive_ok: bool,
        pub accept_frames: bool,
        pub send_ok: bool,
    }

    impl Default for MockBehavior {
        fn default() -> Self {
            Self {
                connect_ok: true,
                keepalive_ok: true,
                accept_frames: true,
                send_ok: true,
            }
        }
    }

    /// Everything the mock observed, for assertions.
    #[derive(Default)]
    pub struct MockLog {
        pub created: AtomicUsize,
        pub connects: AtomicUsize,
        pub disconnects: AtomicUsize,
        pub keepalives: AtomicUsize,
        pub params: Mutex<Vec<ClientParams>>,
        pub chunks: Mutex<Vec<Vec<u8>>>,
    }

    pub struct MockFactory {
        pub log: Arc<MockLog>,
        pub behavior: Arc<Mutex<MockBehavior>>,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self {
                log: Arc::new(MockLog::default()),
                behavior: Arc::new(Mutex::new(MockBehavior::default())),
            }
        }
    }

    impl RaopClientFactory for MockFactory {
        fn create(&self, params: &ClientParams) -> Option<Box<dyn RaopClient>> {
            self.log.created.fetch_add(1, Ordering::SeqCst);
            self.log.params.lock().unwrap().push(params.clone());
            Some(Box::new(MockClient {
                log: self.log.clone(),
                behavior: self.behavior.clone(),
            }))
        }
    }

    pub struct MockClient {
        log: Arc<MockLog>,
        behavior: Arc<Mutex<MockBehavior>>,
    }

    impl RaopClient for MockClient {
        fn connect(&mut self, _host: Ipv4Addr, _port: u16, _set_volume: bool) -> bool {
            self.log.connects.fetch_add(1, Ordering::SeqCst);
            self.behavior.lock().unwrap().connect_ok
        }

        fn disconnect(&mut self) {
            self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn keepalive(&mut self) -> bool {
            self.log.keepalives.fetch_add(1, Ordering::SeqCst);
            self.behavior.lock().unwrap().keepalive_ok
        }

        fn accept_frames(&mut self) -> bool {
            self.behavior.lock().unwrap().accept_frames
        }

        fn send_chunk(&mut self, pcm: &[u8], frames: usize, playtime: &mut u64) -> bool {
            if !self.behavior.lock().unwrap().send_ok {
                return false;
            }
            self.log.chunks.lock().unwrap().push(pcm.to_vec());
            *playtime += frames as u64;
            true
        }

        fn set_volume(&mut self, _volume: f32) -> bool {
            true
        }
    }
}
