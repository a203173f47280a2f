//! Background mDNS browser for `_raop._tcp`
//!
//! Wraps the `mdns-sd` service daemon in the start/stop contract the rest
//! of the bridge expects: a worker thread consumes browse events, keeps an
//! id → [`Speaker`] map, and invokes the snapshot callback with a sorted,
//! deduplicated speaker list after every change.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::discovery::speaker::{display_name, requires_auth, sanitize_et, Speaker};
use crate::error::DiscoveryError;

/// Service type browsed on the local link.
const RAOP_SERVICE_TYPE: &str = "_raop._tcp.local.";

/// How long the worker blocks on the event channel before re-checking the
/// shutdown flag.
const EVENT_POLL: Duration = Duration::from_millis(250);

/// Invoked with the full deduplicated speaker list after every change.
pub type SnapshotCallback = Arc<dyn Fn(Vec<Speaker>) + Send + Sync>;

/// Continuous browser for RAOP speakers on the local network.
pub struct Discovery {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start browsing. `callback` receives a snapshot after each add,
    /// remove, or re-resolve event.
    pub fn start(&mut self, callback: SnapshotCallback) -> Result<(), DiscoveryError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonInit(e.to_string()))?;
        let events = daemon
            .browse(RAOP_SERVICE_TYPE)
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("mdns-browse".to_string())
            .spawn(move || {
                let mut speakers: BTreeMap<String, Speaker> = BTreeMap::new();

                while running.load(Ordering::SeqCst) {
                    let event = match events.recv_timeout(EVENT_POLL) {
                        Ok(event) => event,
                        Err(_) if events.is_disconnected() => {
                            // Hard daemon disconnect: browsing is over.
                            tracing::error!("mDNS daemon disconnected, discovery stopping");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                        Err(_) => continue,
                    };

                    match event {
                        ServiceEvent::ServiceResolved(info) => {
                            match speaker_from_service(&info) {
                                Some(speaker) => {
                                    tracing::info!(
                                        "Speaker '{}' at {}:{} et={} auth_required={}",
                                        speaker.name,
                                        speaker.ipv4,
                                        speaker.port,
                                        if speaker.et.is_empty() { "n/a" } else { &speaker.et },
                                        speaker.requires_auth
                                    );
                                    speakers.insert(speaker.id.clone(), speaker);
                                    callback(snapshot(&speakers));
                                }
                                None => {
                                    tracing::debug!(
                                        "Skipping unresolvable service {}",
                                        info.get_fullname()
                                    );
                                }
                            }
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            if speakers.remove(&fullname).is_some() {
                                tracing::info!("Speaker removed: {}", display_name(&fullname));
                                callback(snapshot(&speakers));
                            }
                        }
                        _ => {}
                    }
                }

                if let Err(e) = daemon.stop_browse(RAOP_SERVICE_TYPE) {
                    tracing::debug!("Failed to stop mDNS browse cleanly: {}", e);
                }
                let _ = daemon.shutdown();
            })
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        self.worker = Some(handle);
        Ok(())
    }

    /// Cooperative stop; joins the worker before returning.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot(speakers: &BTreeMap<String, Speaker>) -> Vec<Speaker> {
    // BTreeMap iteration is already id-ordered and key-unique.
    speakers.values().cloned().collect()
}

/// Translate a resolved mDNS service into a [`Speaker`], or `None` when it
/// has no usable IPv4 address. IPv6-only services are dropped.
fn speaker_from_service(info: &ServiceInfo) -> Option<Speaker> {
    let mut v4: Vec<Ipv4Addr> = info.get_addresses_v4().into_iter().copied().collect();
    v4.sort();
    let ipv4 = v4.into_iter().next().filter(|ip| !ip.is_unspecified())?;

    let fullname = info.get_fullname().to_string();
    let txt: BTreeMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_lowercase(), p.val_str().to_string()))
        .collect();
    let et = sanitize_et(txt.get("et").map(String::as_str).unwrap_or(""));
    let auth = requires_auth(&et, &txt);

    Some(Speaker {
        id: fullname.clone(),
        name: display_name(&fullname),
        hostname: info.get_hostname().trim_end_matches('.').to_string(),
        ipv4,
        port: info.get_port(),
        txt,
        et,
        requires_auth: auth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_speaker_from_resolved_service() {
        let mut txt = HashMap::new();
        txt.insert("et".to_string(), "0, 1, 4".to_string());
        txt.insert("pw".to_string(), "1".to_string());
        let info = ServiceInfo::new(
            RAOP_SERVICE_TYPE,
            "AABB@Den",
            "den.local.",
            "192.168.1.40",
            7000,
            txt,
        )
        .unwrap();

        let speaker = speaker_from_service(&info).unwrap();
        assert_eq!(speaker.id, "AABB@Den._raop._tcp.local.");
        assert_eq!(speaker.name, "AABB@Den");
        assert_eq!(speaker.hostname, "den.local");
        assert_eq!(speaker.ipv4, Ipv4Addr::new(192, 168, 1, 40));
        assert_eq!(speaker.port, 7000);
        assert_eq!(speaker.et, "0,1,4");
        assert!(speaker.requires_auth);
    }

    #[test]
    fn test_service_without_ipv4_is_dropped() {
        let info = ServiceInfo::new(
            RAOP_SERVICE_TYPE,
            "NoAddr",
            "noaddr.local.",
            "",
            7000,
            HashMap::<String, String>::new(),
        )
        .unwrap();
        assert!(speaker_from_service(&info).is_none());
    }

    #[test]
    fn test_snapshot_is_sorted_by_id() {
        let mut speakers = BTreeMap::new();
        for id in ["b", "a", "c"] {
            speakers.insert(
                id.to_string(),
                crate::state::testutil::speaker(id, [10, 0, 0, 1], 7000, "0"),
            );
        }
        let snap = snapshot(&speakers);
        let ids: Vec<&str> = snap.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
