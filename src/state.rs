//! Shared application state
//!
//! One mutex guards both the speaker registry and the group map: every
//! multi-field read and every mutation of either goes through it, which is
//! what keeps the registry, the group engines, and a concurrently rendered
//! UI consistent. Counters and flags that are touched from hot paths are
//! atomics next to the mutex, not inside it.
//!
//! Hostages are `Arc<Mutex<_>>` so callers can snapshot the handles under
//! the state lock and do protocol I/O after releasing it; the per-hostage
//! mutex serializes the streamer against the heartbeat.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};

use crate::config::StaticSpeaker;
use crate::discovery::Speaker;
use crate::raop::RaopHostage;
use crate::receiver::ReceiverProcess;

/// Shared handle to one hostage.
pub type SharedHostage = Arc<Mutex<RaopHostage>>;

/// Registry row for one known speaker.
pub struct SpeakerState {
    pub info: Speaker,
    /// Present in the most recent discovery snapshot.
    pub connected: bool,
    /// Claimed by a group. Survives offline transitions so a returning
    /// speaker rejoins its group.
    pub reserved: bool,
    /// Live RAOP session, if any.
    pub hostage: Option<SharedHostage>,
    /// Consecutive frame-gate failures seen by the streamer.
    pub not_ready_streak: u32,
    /// Failed reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
}

impl SpeakerState {
    pub fn new(info: Speaker) -> Self {
        Self {
            info,
            connected: false,
            reserved: false,
            hostage: None,
            not_ready_streak: 0,
            reconnect_attempts: 0,
        }
    }

    /// True when a live, connected hostage holds this speaker.
    pub fn held_hostage(&self) -> bool {
        self.hostage
            .as_ref()
            .map(|h| h.lock().unwrap().is_connected())
            .unwrap_or(false)
    }
}

/// One active fan-out group.
pub struct Group {
    pub name: String,
    pub port: u16,
    pub parent_interface: String,
    pub member_ids: Vec<String>,
    pub process: Option<ReceiverProcess>,
    /// Partial PCM bytes waiting to fill a chunk. Always shorter than one
    /// chunk between ingest calls.
    pub pending: BytesMut,
    /// Re-chunked PCM awaiting the streamer, oldest first.
    pub chunk_queue: VecDeque<Bytes>,
    pub streamer_running: bool,
    pub streamer: Option<JoinHandle<()>>,
    /// Silence chunks emitted since the last real audio.
    pub consecutive_silence_chunks: u64,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        port: u16,
        parent_interface: impl Into<String>,
        member_ids: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            parent_interface: parent_interface.into(),
            member_ids,
            process: None,
            pending: BytesMut::new(),
            chunk_queue: VecDeque::new(),
            streamer_running: false,
            streamer: None,
            consecutive_silence_chunks: 0,
        }
    }
}

/// Everything behind the single state mutex.
#[derive(Default)]
pub struct BridgeState {
    pub speakers: BTreeMap<String, SpeakerState>,
    pub groups: BTreeMap<String, Group>,
}

struct Inner {
    state: Mutex<BridgeState>,
    running: Arc<AtomicBool>,
    chunk_counter: AtomicU64,
    status: Mutex<String>,
    ui_dirty: AtomicBool,
}

/// Cheap-to-clone handle on the whole application state. The UI side only
/// ever calls the read operations (snapshots, status, dirty flag).
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BridgeState::default()),
                running: Arc::new(AtomicBool::new(true)),
                chunk_counter: AtomicU64::new(0),
                status: Mutex::new(String::new()),
                ui_dirty: AtomicBool::new(true),
            }),
        }
    }

    /// Acquire the state mutex.
    pub fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.inner.state.lock().unwrap()
    }

    /// The global run flag, cloneable for signal handlers.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.inner.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Advance the global chunk counter; returns the new count.
    pub fn count_chunk(&self) -> u64 {
        self.inner.chunk_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn chunks_sent(&self) -> u64 {
        self.inner.chunk_counter.load(Ordering::Relaxed)
    }

    /// Update the UI status line.
    pub fn set_status(&self, message: impl Into<String>) {
        *self.inner.status.lock().unwrap() = message.into();
        self.request_refresh();
    }

    pub fn status(&self) -> String {
        self.inner.status.lock().unwrap().clone()
    }

    /// Flag the UI for a redraw.
    pub fn request_refresh(&self) {
        self.inner.ui_dirty.store(true, Ordering::SeqCst);
    }

    /// Consume the dirty flag; the renderer calls this once per frame.
    pub fn take_dirty(&self) -> bool {
        self.inner.ui_dirty.swap(false, Ordering::SeqCst)
    }

    /// Merge a discovery snapshot into the registry: present speakers are
    /// upserted and marked connected, absent ones go offline and lose
    /// their hostage (reservations stay so returning speakers rejoin
    /// their group). Hostage disconnects run after the lock is released.
    pub fn apply_snapshot(&self, snapshot: Vec<Speaker>) {
        let mut dropped: Vec<(String, SharedHostage)> = Vec::new();
        {
            let mut state = self.lock();
            let seen: Vec<String> = snapshot.iter().map(|s| s.id.clone()).collect();

            for speaker in snapshot {
                let entry = state
                    .speakers
                    .entry(speaker.id.clone())
                    .or_insert_with(|| SpeakerState::new(speaker.clone()));
                entry.info = speaker;
                entry.connected = true;
            }

            for (id, row) in state.speakers.iter_mut() {
                if !seen.contains(id) {
                    row.connected = false;
                    if let Some(hostage) = row.hostage.take() {
                        // A fresh hostage starts with a clean retry slate
                        // when the speaker comes back.
                        row.not_ready_streak = 0;
                        row.reconnect_attempts = 0;
                        dropped.push((id.clone(), hostage));
                    }
                }
            }
        }

        for (id, hostage) in dropped {
            hostage.lock().unwrap().disconnect();
            tracing::info!(target: "raop", "Disconnected (offline): {}", id);
        }
        self.request_refresh();
    }

    /// Seed the registry with statically configured speakers so they show
    /// up (offline) before discovery finds them.
    pub fn seed_static(&self, speakers: &[StaticSpeaker]) {
        let mut state = self.lock();
        for entry in speakers {
            let Ok(ipv4) = entry.ip.parse::<std::net::Ipv4Addr>() else {
                tracing::warn!("Ignoring configured speaker with bad ip {:?}", entry.ip);
                continue;
            };
            let id = format!("static:{}:{}", entry.ip, entry.port);
            let name = if entry.name.is_empty() {
                entry.ip.clone()
            } else {
                entry.name.clone()
            };
            state.speakers.entry(id.clone()).or_insert_with(|| {
                SpeakerState::new(Speaker {
                    id,
                    name,
                    hostname: entry.ip.clone(),
                    ipv4,
                    port: entry.port,
                    txt: Default::default(),
                    et: String::new(),
                    requires_auth: false,
                })
            });
        }
    }

    /// Snapshot everything the UI needs in one lock acquisition.
    pub fn snapshots(&self) -> (Vec<GroupSnapshot>, Vec<SpeakerSnapshot>) {
        let state = self.lock();

        let groups = state
            .groups
            .values()
            .map(|group| {
                let members: Vec<MemberSnapshot> = group
                    .member_ids
                    .iter()
                    .map(|id| {
                        let row = state.speakers.get(id);
                        MemberSnapshot {
                            name: row
                                .map(|r| r.info.name.clone())
                                .filter(|n| !n.is_empty())
                                .unwrap_or_else(|| id.clone()),
                            connected: row.map(|r| r.connected).unwrap_or(false),
                        }
                    })
                    .collect();
                let healthy = members.iter().all(|m| m.connected);
                GroupSnapshot {
                    name: group.name.clone(),
                    port: group.port,
                    healthy,
                    bytes_received: group.process.as_ref().map_or(0, |p| p.bytes_received()),
                    last_chunk_bytes: group.process.as_ref().map_or(0, |p| p.last_chunk_bytes()),
                    last_chunk_age_ms: group
                        .process
                        .as_ref()
                        .map_or(-1, |p| p.millis_since_last_chunk()),
                    members,
                }
            })
            .collect();

        let speakers = state
            .speakers
            .iter()
            .map(|(id, row)| SpeakerSnapshot {
                name: if row.info.name.is_empty() {
                    id.clone()
                } else {
                    row.info.name.clone()
                },
                ip: row.info.ipv4.to_string(),
                port: row.info.port,
                connected: row.connected,
                reserved: row.reserved,
                hostage: row.held_hostage(),
            })
            .collect();

        (groups, speakers)
    }

    /// Aggregate numbers for the UI header.
    pub fn overview(&self) -> OverviewStats {
        let (groups, speakers) = self.snapshots();
        OverviewStats {
            total_groups: groups.len(),
            active_groups: groups.iter().filter(|g| g.bytes_received > 0).count(),
            total_speakers: speakers.len(),
            online_speakers: speakers.iter().filter(|s| s.connected).count(),
            locked_speakers: speakers.iter().filter(|s| s.reserved).count(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Group member as shown in the UI.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub name: String,
    pub connected: bool,
}

/// Read-only view of one group.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub name: String,
    pub port: u16,
    /// All members currently online.
    pub healthy: bool,
    pub bytes_received: u64,
    pub last_chunk_bytes: u64,
    pub last_chunk_age_ms: i64,
    pub members: Vec<MemberSnapshot>,
}

/// Read-only view of one speaker row.
#[derive(Debug, Clone)]
pub struct SpeakerSnapshot {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub connected: bool,
    pub reserved: bool,
    pub hostage: bool,
}

/// Header numbers for the UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverviewStats {
    pub total_groups: usize,
    pub active_groups: usize,
    pub total_speakers: usize,
    pub online_speakers: usize,
    pub locked_speakers: usize,
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::net::Ipv4Addr;

    pub fn speaker(id: &str, ip: [u8; 4], port: u16, et: &str) -> Speaker {
        Speaker {
            id: id.to_string(),
            name: id.to_string(),
            hostname: format!("{id}.local"),
            ipv4: Ipv4Addr::from(ip),
            port,
            txt: Default::default(),
            et: et.to_string(),
            requires_auth: et.contains('4'),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::speaker;
    use super::*;
    use crate::raop::client::mock::MockFactory;
    use std::net::TcpListener;

    #[test]
    fn test_snapshot_merge_marks_connected() {
        let state = AppState::new();
        state.apply_snapshot(vec![speaker("A", [10, 0, 0, 2], 7000, "0,1")]);

        let guard = state.lock();
        let row = guard.speakers.get("A").unwrap();
        assert!(row.connected);
        assert_eq!(row.info.port, 7000);
    }

    #[test]
    fn test_snapshot_merge_is_idempotent() {
        let state = AppState::new();
        let snap = vec![
            speaker("A", [10, 0, 0, 2], 7000, "0,1"),
            speaker("B", [10, 0, 0, 3], 7000, "4"),
        ];
        state.apply_snapshot(snap.clone());
        state.apply_snapshot(snap);

        let guard = state.lock();
        assert_eq!(guard.speakers.len(), 2);
        assert!(guard.speakers.values().all(|r| r.connected));
        assert!(guard.speakers.values().all(|r| !r.reserved));
    }

    #[test]
    fn test_offline_speaker_keeps_reservation_loses_hostage() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = AppState::new();
        state.apply_snapshot(vec![speaker("A", [127, 0, 0, 1], port, "0")]);

        // Reserve and attach a connected hostage, as group creation would.
        {
            let mut guard = state.lock();
            let row = guard.speakers.get_mut("A").unwrap();
            row.reserved = true;
            let mut hostage = RaopHostage::new(
                "A",
                row.info.ipv4,
                row.info.port,
                "0",
                false,
                Arc::new(MockFactory::new()),
            );
            assert!(hostage.connect());
            row.hostage = Some(Arc::new(Mutex::new(hostage)));
        }

        // Speaker absent from the next snapshot: offline, hostage gone,
        // reservation intact.
        state.apply_snapshot(vec![]);
        let guard = state.lock();
        let row = guard.speakers.get("A").unwrap();
        assert!(!row.connected);
        assert!(row.reserved);
        assert!(row.hostage.is_none());
    }

    #[test]
    fn test_seed_static_speakers() {
        let state = AppState::new();
        state.seed_static(&[
            crate::config::StaticSpeaker {
                ip: "10.0.0.9".to_string(),
                name: "Attic".to_string(),
                port: 5000,
            },
            crate::config::StaticSpeaker {
                ip: "not-an-ip".to_string(),
                name: String::new(),
                port: 5000,
            },
        ]);

        let guard = state.lock();
        assert_eq!(guard.speakers.len(), 1);
        let row = guard.speakers.values().next().unwrap();
        assert_eq!(row.info.name, "Attic");
        assert!(!row.connected);
    }

    #[test]
    fn test_group_snapshot_health() {
        let state = AppState::new();
        state.apply_snapshot(vec![
            speaker("A", [10, 0, 0, 2], 7000, "0"),
            speaker("B", [10, 0, 0, 3], 7000, "0"),
        ]);
        {
            let mut guard = state.lock();
            guard.groups.insert(
                "liv".to_string(),
                Group::new("liv", 6000, "eth0", vec!["A".to_string(), "B".to_string()]),
            );
        }

        let (groups, _) = state.snapshots();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].healthy);
        assert_eq!(groups[0].members.len(), 2);

        // B drops out of the next snapshot; the group degrades.
        state.apply_snapshot(vec![speaker("A", [10, 0, 0, 2], 7000, "0")]);
        let (groups, _) = state.snapshots();
        assert!(!groups[0].healthy);
    }

    #[test]
    fn test_status_line_and_dirty_flag() {
        let state = AppState::new();
        assert!(state.take_dirty());
        assert!(!state.take_dirty());

        state.set_status("Ready.");
        assert_eq!(state.status(), "Ready.");
        assert!(state.take_dirty());
    }

    #[test]
    fn test_chunk_counter_monotonic() {
        let state = AppState::new();
        assert_eq!(state.count_chunk(), 1);
        assert_eq!(state.count_chunk(), 2);
        assert_eq!(state.chunks_sent(), 2);
    }

    #[test]
    fn test_overview_counts() {
        let state = AppState::new();
        state.apply_snapshot(vec![
            speaker("A", [10, 0, 0, 2], 7000, "0"),
            speaker("B", [10, 0, 0, 3], 7000, "0"),
        ]);
        {
            let mut guard = state.lock();
            guard.speakers.get_mut("A").unwrap().reserved = true;
            guard
                .groups
                .insert("g".to_string(), Group::new("g", 6000, "eth0", vec!["A".to_string()]));
        }
        state.apply_snapshot(vec![speaker("A", [10, 0, 0, 2], 7000, "0")]);

        let stats = state.overview();
        assert_eq!(stats.total_groups, 1);
        assert_eq!(stats.active_groups, 0);
        assert_eq!(stats.total_speakers, 2);
        assert_eq!(stats.online_speakers, 1);
        assert_eq!(stats.locked_speakers, 1);
    }
}
