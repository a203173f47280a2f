//! Per-speaker RAOP session ("hostage")
//!
//! A hostage is one held-open RAOP connection to one speaker. Holding the
//! session means competing AirPlay sources cannot grab the speaker while a
//! group owns it. The state machine is
//! `Disconnected → Reachable? → Connected(auth on/off) → Disconnected`,
//! with reconnects driven by keep-alive failures and frame-gate stalls.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use super::client::{ClientParams, Crypto, RaopClient, RaopClientFactory};

/// TCP reachability probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default poll bound for [`RaopHostage::wait_for_frames_ready`].
pub const FRAME_WAIT_ATTEMPTS: u32 = 200;

/// Default delay between frame-gate polls.
pub const FRAME_WAIT_DELAY: Duration = Duration::from_millis(1);

/// Crypto/auth decision for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityPlan {
    pub crypto: Crypto,
    pub enable_auth: bool,
    /// The et token string handed to the client library, `None` when the
    /// speaker advertised none.
    pub et_to_send: Option<String>,
}

/// Compute the crypto mode and auth flag for a connection attempt from the
/// speaker's `et` capability tokens.
///
/// Tokens: `'0'` clear, `'1'`/`'3'`/`'4'` RSA-capable, `'4'` FairPlay.
/// RSA is used when the speaker refuses clear payloads or when auth is
/// enabled; auth is only enabled when requested *and* the speaker speaks
/// FairPlay. If auth is enabled and `'4'` is missing from the token string
/// it is appended before handing it to the library.
pub fn select_capabilities(et: &str, attempt_auth: bool) -> CapabilityPlan {
    let support_clear = et.contains('0');
    let support_rsa = et.contains('1') || et.contains('3') || et.contains('4');
    let support_fp = et.contains('4');

    let enable_auth = attempt_auth && support_fp;
    let use_rsa = (!support_clear && support_rsa) || enable_auth;
    let crypto = if use_rsa { Crypto::Rsa } else { Crypto::Clear };

    let mut et_value = et.to_string();
    if enable_auth && !et_value.contains('4') {
        if !et_value.is_empty() {
            et_value.push(',');
        }
        et_value.push('4');
    }

    CapabilityPlan {
        crypto,
        enable_auth,
        et_to_send: if et_value.is_empty() { None } else { Some(et_value) },
    }
}

/// One held-open RAOP session.
pub struct RaopHostage {
    id: String,
    ipv4: Ipv4Addr,
    port: u16,
    et: String,
    prefer_auth: bool,
    factory: Arc<dyn RaopClientFactory>,
    client: Option<Box<dyn RaopClient>>,
    connected: bool,
    last_auth_used: bool,
    playtime: u64,
}

impl RaopHostage {
    pub fn new(
        id: impl Into<String>,
        ipv4: Ipv4Addr,
        port: u16,
        et: impl Into<String>,
        prefer_auth: bool,
        factory: Arc<dyn RaopClientFactory>,
    ) -> Self {
        Self {
            id: id.into(),
            ipv4,
            port,
            et: et.into(),
            prefer_auth,
            factory,
            client: None,
            connected: false,
            last_auth_used: false,
            playtime: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_auth_used(&self) -> bool {
        self.last_auth_used
    }

    /// Frames played so far, as reported back by the client library.
    pub fn playtime(&self) -> u64 {
        self.playtime
    }

    /// Try to establish the session. Attempts run in the order
    /// `[prefer_auth, !prefer_auth]`; each attempt probes plain TCP
    /// reachability first and gives the next strategy a chance on failure.
    /// Returns true on the first success.
    pub fn connect(&mut self) -> bool {
        if self.connected {
            return true;
        }

        let order = [self.prefer_auth, !self.prefer_auth];
        for (i, &attempt_auth) in order.iter().enumerate() {
            if i == 1 && order[1] == order[0] {
                break;
            }

            if !self.probe_reachable() {
                continue;
            }

            if self.attempt_connect(attempt_auth) {
                return true;
            }

            tracing::warn!(
                target: "raop",
                "RAOP connect failed for {} in auth mode {}",
                self.id,
                if attempt_auth { "ON" } else { "OFF" }
            );
        }

        tracing::warn!(target: "raop", "Exhausted all connection strategies for {}", self.id);
        false
    }

    /// Tear the session down. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(mut client) = self.client.take() {
            if self.connected {
                client.disconnect();
            }
        }
        self.connected = false;
    }

    /// Keep-alive tick. A failed keep-alive drops the session and
    /// immediately tries to re-establish it.
    pub fn pulse(&mut self) {
        if !self.connected {
            return;
        }
        let alive = self.client.as_mut().map(|c| c.keepalive()).unwrap_or(false);
        if !alive {
            tracing::warn!(target: "raop", "Keep-alive failed for {}, reconnecting", self.id);
            self.disconnect();
            self.connect();
        }
    }

    /// Whether the library currently has room for another chunk.
    pub fn accept_frames(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.client.as_mut().map(|c| c.accept_frames()).unwrap_or(false)
    }

    /// Poll [`accept_frames`](Self::accept_frames) until it reports room,
    /// up to `max_attempts` polls `delay` apart. Returns false once the
    /// budget is exhausted.
    pub fn wait_for_frames_ready(&mut self, max_attempts: u32, delay: Duration) -> bool {
        if !self.connected {
            return false;
        }
        for _ in 0..max_attempts {
            if self.accept_frames() {
                return true;
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        false
    }

    /// Send one PCM chunk (16-bit stereo, so 4 bytes per frame). The chunk
    /// length must be frame-aligned.
    pub fn send_audio_chunk(&mut self, pcm: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        if pcm.len() % crate::constants::BYTES_PER_FRAME != 0 {
            tracing::warn!(
                target: "raop",
                "Dropping unaligned chunk of {} bytes for {}",
                pcm.len(),
                self.id
            );
            return false;
        }
        let frames = pcm.len() / crate::constants::BYTES_PER_FRAME;
        if frames == 0 {
            return false;
        }
        match self.client.as_mut() {
            Some(client) => client.send_chunk(pcm, frames, &mut self.playtime),
            None => false,
        }
    }

    /// Apply a playback volume in `[0.0, 1.0]`.
    pub fn set_volume(&mut self, volume: f32) -> bool {
        if !self.connected {
            return false;
        }
        self.client.as_mut().map(|c| c.set_volume(volume)).unwrap_or(false)
    }

    fn probe_reachable(&self) -> bool {
        if self.ipv4.is_unspecified() {
            tracing::warn!(target: "raop", "Skipping RAOP connect to 0.0.0.0 for {}", self.id);
            return false;
        }
        let addr = SocketAddr::from((self.ipv4, self.port));
        match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    target: "raop",
                    "Cannot reach {} at {}: {}",
                    self.id,
                    addr,
                    e
                );
                false
            }
        }
    }

    fn attempt_connect(&mut self, attempt_auth: bool) -> bool {
        // Clean slate for this attempt.
        self.disconnect();

        let plan = select_capabilities(&self.et, attempt_auth);
        tracing::info!(
            target: "raop",
            "Creating RAOP client for {} (auth={}, crypto={:?}, et={})",
            self.id,
            if attempt_auth { "ON" } else { "OFF" },
            plan.crypto,
            plan.et_to_send.as_deref().unwrap_or("none")
        );

        let params = ClientParams::standard(plan.crypto, plan.enable_auth, plan.et_to_send);
        let mut client = match self.factory.create(&params) {
            Some(client) => client,
            None => {
                tracing::warn!(target: "raop", "RAOP client creation failed for {}", self.id);
                return false;
            }
        };

        if !client.connect(self.ipv4, self.port, true) {
            // Dropping the client tears it down.
            return false;
        }

        self.client = Some(client);
        self.connected = true;
        self.last_auth_used = attempt_auth;
        tracing::info!(
            target: "raop",
            "RAOP connect succeeded for {} (auth={})",
            self.id,
            if attempt_auth { "ON" } else { "OFF" }
        );
        true
    }
}

impl Drop for RaopHostage {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raop::client::mock::MockFactory;
    use std::net::TcpListener;

    /// Every representable (support_clear, support_rsa, support_fp)
    /// combination crossed with both auth requests. `'4'` implies RSA
    /// support, so fp-without-rsa cannot occur.
    #[test]
    fn test_capability_selection_table() {
        let cases = [
            // (et, attempt_auth, crypto, enable_auth)
            ("", false, Crypto::Clear, false),
            ("", true, Crypto::Clear, false),
            ("0", false, Crypto::Clear, false),
            ("0", true, Crypto::Clear, false),
            ("1", false, Crypto::Rsa, false),
            ("1", true, Crypto::Rsa, false),
            ("3", false, Crypto::Rsa, false),
            ("0,1", false, Crypto::Clear, false),
            ("0,1", true, Crypto::Clear, false),
            ("4", false, Crypto::Rsa, false),
            ("4", true, Crypto::Rsa, true),
            ("0,4", false, Crypto::Clear, false),
            ("0,4", true, Crypto::Rsa, true),
            ("0,1,3,4", true, Crypto::Rsa, true),
        ];

        for (et, attempt_auth, crypto, enable_auth) in cases {
            let plan = select_capabilities(et, attempt_auth);
            assert_eq!(plan.crypto, crypto, "et={et:?} attempt_auth={attempt_auth}");
            assert_eq!(
                plan.enable_auth, enable_auth,
                "et={et:?} attempt_auth={attempt_auth}"
            );
        }
    }

    #[test]
    fn test_capability_et_passthrough() {
        assert_eq!(select_capabilities("0,1", true).et_to_send.as_deref(), Some("0,1"));
        assert_eq!(select_capabilities("4", true).et_to_send.as_deref(), Some("4"));
        assert_eq!(select_capabilities("", true).et_to_send, None);
    }

    fn local_listener() -> (TcpListener, Ipv4Addr, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, Ipv4Addr::LOCALHOST, addr.port())
    }

    #[test]
    fn test_connect_auth_first_for_locked_speaker() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let log = factory.log.clone();

        let mut hostage =
            RaopHostage::new("B", ip, port, "4", true, Arc::new(factory));
        assert!(hostage.connect());
        assert!(hostage.is_connected());
        assert!(hostage.last_auth_used());

        let params = log.params.lock().unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].crypto, Crypto::Rsa);
        assert!(params[0].auth);
        assert_eq!(params[0].et.as_deref(), Some("4"));
    }

    #[test]
    fn test_connect_falls_back_to_second_strategy() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let log = factory.log.clone();
        factory.behavior.lock().unwrap().connect_ok = false;

        let mut hostage =
            RaopHostage::new("B", ip, port, "0,4", true, Arc::new(factory));
        assert!(!hostage.connect());
        assert!(!hostage.is_connected());

        let params = log.params.lock().unwrap();
        assert_eq!(params.len(), 2);
        assert!(params[0].auth);
        assert!(!params[1].auth);
    }

    #[test]
    fn test_connect_is_idempotent_while_connected() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let log = factory.log.clone();

        let mut hostage =
            RaopHostage::new("A", ip, port, "0", false, Arc::new(factory));
        assert!(hostage.connect());
        assert!(hostage.connect());
        assert_eq!(log.created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreachable_speaker_fails_fast() {
        // Nothing listens on this port after the listener is dropped.
        let (listener, ip, port) = local_listener();
        drop(listener);

        let factory = MockFactory::new();
        let log = factory.log.clone();
        let mut hostage =
            RaopHostage::new("A", ip, port, "0", false, Arc::new(factory));
        assert!(!hostage.connect());
        // The client library was never invoked.
        assert_eq!(log.created.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pulse_reconnects_after_keepalive_failure() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let log = factory.log.clone();
        let behavior = factory.behavior.clone();

        let mut hostage =
            RaopHostage::new("A", ip, port, "0", false, Arc::new(factory));
        assert!(hostage.connect());

        behavior.lock().unwrap().keepalive_ok = false;
        hostage.pulse();

        // Old session torn down, one fresh connect attempted.
        assert_eq!(log.disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(log.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(hostage.is_connected());
    }

    #[test]
    fn test_send_audio_chunk_requires_frame_alignment() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let log = factory.log.clone();

        let mut hostage =
            RaopHostage::new("A", ip, port, "0", false, Arc::new(factory));
        assert!(hostage.connect());

        assert!(!hostage.send_audio_chunk(&[0u8; 5]));
        assert!(log.chunks.lock().unwrap().is_empty());

        assert!(hostage.send_audio_chunk(&[0u8; 1408]));
        assert_eq!(log.chunks.lock().unwrap().len(), 1);
        assert_eq!(hostage.playtime(), 352);
    }

    #[test]
    fn test_wait_for_frames_ready_exhausts() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let behavior = factory.behavior.clone();

        let mut hostage =
            RaopHostage::new("A", ip, port, "0", false, Arc::new(factory));
        assert!(hostage.connect());
        assert!(hostage.wait_for_frames_ready(3, Duration::ZERO));

        behavior.lock().unwrap().accept_frames = false;
        assert!(!hostage.wait_for_frames_ready(3, Duration::ZERO));
    }

    #[test]
    fn test_disconnected_hostage_refuses_io() {
        let (_listener, ip, port) = local_listener();
        let factory = MockFactory::new();
        let mut hostage =
            RaopHostage::new("A", ip, port, "0", false, Arc::new(factory));

        assert!(!hostage.accept_frames());
        assert!(!hostage.send_audio_chunk(&[0u8; 1408]));
        assert!(!hostage.wait_for_frames_ready(1, Duration::ZERO));
        hostage.disconnect();
        hostage.disconnect();
    }
}
