//! Per-group audio engine: ingest re-chunking and the streamer loop
//!
//! Two activities share the group row under the state mutex. **Ingest**
//! runs on the receiver's reader thread: it accumulates raw PCM and carves
//! it into fixed 1408-byte chunks on a bounded queue, dropping the oldest
//! on overflow so the stream favors freshness over completeness.
//! **The streamer** runs on its own thread per group: it pops chunks (or
//! synthesizes silence when the queue is dry, which keeps the RAOP
//! sessions claimed between songs), gates on every member's frame
//! readiness, and fans the chunk out to all connected hostages. A stalled
//! member gets one forced reconnect; a real chunk it blocked is requeued
//! at the head exactly once, while a blocked silence chunk is simply
//! dropped.
//!
//! The state lock is only ever held for queue and bookkeeping work; all
//! protocol I/O happens on snapshotted hostage handles after release.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::constants::{CHUNK_BYTES, MAX_QUEUED_CHUNKS};
use crate::raop::hostage::{FRAME_WAIT_ATTEMPTS, FRAME_WAIT_DELAY};
use crate::raop::{RaopClientFactory, RaopHostage};
use crate::state::{AppState, Group, SharedHostage};

/// Streamer sleep after a silence chunk.
const SILENCE_SLEEP: Duration = Duration::from_millis(1);

/// Streamer sleep once silence has lasted over [`LONG_SILENCE_THRESHOLD`]
/// chunks, and after a requeue.
const BACKOFF_SLEEP: Duration = Duration::from_millis(2);

/// Consecutive silence chunks after which the streamer slows down.
const LONG_SILENCE_THRESHOLD: u64 = 1000;

/// Frame-gate failures tolerated before a forced reconnect.
const NOT_READY_RECONNECT_THRESHOLD: u32 = 1;

static SILENCE: [u8; CHUNK_BYTES] = [0u8; CHUNK_BYTES];

fn silence_chunk() -> Bytes {
    Bytes::from_static(&SILENCE)
}

/// Fold freshly read PCM into the group's chunk queue.
///
/// Invariants kept: the pending buffer stays shorter than one chunk, the
/// queue never exceeds [`MAX_QUEUED_CHUNKS`] (oldest dropped first), and
/// any ingest resets the silence counter.
pub fn ingest(group: &mut Group, data: &[u8]) {
    if data.is_empty() {
        return;
    }

    group.pending.extend_from_slice(data);
    while group.pending.len() >= CHUNK_BYTES {
        let chunk = group.pending.split_to(CHUNK_BYTES).freeze();
        group.chunk_queue.push_back(chunk);
        if group.chunk_queue.len() > MAX_QUEUED_CHUNKS {
            group.chunk_queue.pop_front();
        }
    }

    if group.consecutive_silence_chunks > 0 {
        tracing::info!(
            group = %group.name,
            "Audio resumed after {} silence chunks",
            group.consecutive_silence_chunks
        );
    }
    group.consecutive_silence_chunks = 0;
}

/// One iteration's outcome for the readiness phase.
struct Blocked {
    id: String,
    was_connected: bool,
}

/// The per-group streamer loop. Returns when the group row disappears or
/// its `streamer_running` flag goes down.
pub fn run_streamer(state: AppState, group_name: String, factory: Arc<dyn RaopClientFactory>) {
    tracing::info!(group = %group_name, "Streamer started");

    loop {
        // Phase 1: pop one chunk and snapshot hostage handles under the lock.
        let (chunk, is_silence, hostages) = {
            let mut guard = state.lock();
            let bridge = &mut *guard;
            let Some(group) = bridge.groups.get_mut(&group_name) else {
                tracing::warn!(group = %group_name, "Group row gone, streamer exiting");
                return;
            };
            if !group.streamer_running {
                break;
            }

            let (chunk, is_silence) = match group.chunk_queue.pop_front() {
                Some(chunk) => (chunk, false),
                None => (silence_chunk(), true),
            };

            let mut hostages: Vec<(String, SharedHostage)> = Vec::new();
            for id in &group.member_ids {
                let Some(row) = bridge.speakers.get_mut(id) else {
                    continue;
                };
                // A member that came back online after losing its hostage
                // gets a fresh one; it connects through the stall path.
                if row.hostage.is_none()
                    && row.connected
                    && !row.info.ipv4.is_unspecified()
                    && row.info.port > 0
                {
                    row.hostage = Some(Arc::new(std::sync::Mutex::new(RaopHostage::new(
                        row.info.id.clone(),
                        row.info.ipv4,
                        row.info.port,
                        row.info.et.clone(),
                        row.info.requires_auth,
                        factory.clone(),
                    ))));
                    row.not_ready_streak = 0;
                    row.reconnect_attempts = 0;
                }
                if let Some(hostage) = &row.hostage {
                    hostages.push((id.clone(), hostage.clone()));
                }
            }
            (chunk, is_silence, hostages)
        };

        // Phase 2: frame-readiness gate, lock released.
        let mut blocked: Option<Blocked> = None;
        for (id, hostage) in &hostages {
            let mut hostage = hostage.lock().unwrap();
            let was_connected = hostage.is_connected();
            if !was_connected
                || !hostage.wait_for_frames_ready(FRAME_WAIT_ATTEMPTS, FRAME_WAIT_DELAY)
            {
                blocked = Some(Blocked {
                    id: id.clone(),
                    was_connected,
                });
                break;
            }
        }

        if let Some(stalled) = blocked {
            let requeued = handle_stall(&state, &group_name, &hostages, stalled, chunk, is_silence);
            std::thread::sleep(if requeued { BACKOFF_SLEEP } else { SILENCE_SLEEP });
            continue;
        }

        // Phase 3: account, then fan the chunk out.
        state.count_chunk();
        let silence_count = {
            let mut guard = state.lock();
            let Some(group) = guard.groups.get_mut(&group_name) else {
                break;
            };
            if is_silence {
                group.consecutive_silence_chunks += 1;
                if group.consecutive_silence_chunks == 1 {
                    tracing::debug!(group = %group_name, "Queue drained, emitting silence");
                }
            } else {
                group.consecutive_silence_chunks = 0;
            }
            group.consecutive_silence_chunks
        };

        let mut send_failures: Vec<String> = Vec::new();
        for (id, hostage) in &hostages {
            let mut hostage = hostage.lock().unwrap();
            if !hostage.is_connected() {
                continue;
            }
            if !hostage.send_audio_chunk(&chunk) {
                tracing::warn!(target: "raop", "Chunk send failed for {}, reconnecting", id);
                hostage.disconnect();
                if !hostage.connect() {
                    send_failures.push(id.clone());
                }
            }
        }
        if !send_failures.is_empty() {
            let mut guard = state.lock();
            for id in send_failures {
                if let Some(row) = guard.speakers.get_mut(&id) {
                    row.reconnect_attempts += 1;
                }
            }
        }

        // Phase 4: pacing. Real audio streams as fast as the gate allows.
        if is_silence {
            std::thread::sleep(if silence_count > LONG_SILENCE_THRESHOLD {
                BACKOFF_SLEEP
            } else {
                SILENCE_SLEEP
            });
        }
    }

    tracing::info!(group = %group_name, "Streamer exiting");
}

/// A member failed the readiness gate: requeue a real chunk at the head
/// (silence is droppable), bump the member's streak, and force one
/// reconnect at the threshold. A hostage that is already disconnected and
/// has a failed reconnect on record waits for recovery elsewhere instead
/// of being hammered every iteration.
///
/// Returns whether the chunk was requeued.
fn handle_stall(
    state: &AppState,
    group_name: &str,
    hostages: &[(String, SharedHostage)],
    stalled: Blocked,
    chunk: Bytes,
    is_silence: bool,
) -> bool {
    let (requeued, reconnect) = {
        let mut guard = state.lock();
        let bridge = &mut *guard;

        let mut requeued = false;
        if let Some(group) = bridge.groups.get_mut(group_name) {
            if !is_silence {
                group.chunk_queue.push_front(chunk);
                requeued = true;
            }
        }

        let reconnect = match bridge.speakers.get_mut(&stalled.id) {
            Some(row) => {
                row.not_ready_streak += 1;
                let eligible = stalled.was_connected || row.reconnect_attempts == 0;
                row.not_ready_streak >= NOT_READY_RECONNECT_THRESHOLD && eligible
            }
            None => false,
        };
        (requeued, reconnect)
    };

    if reconnect {
        let handle = hostages
            .iter()
            .find(|(id, _)| *id == stalled.id)
            .map(|(_, h)| h.clone());
        if let Some(handle) = handle {
            tracing::warn!(
                target: "raop",
                "Speaker {} not ready, forcing reconnect",
                stalled.id
            );
            let ok = {
                let mut hostage = handle.lock().unwrap();
                hostage.disconnect();
                hostage.connect()
            };
            let mut guard = state.lock();
            if let Some(row) = guard.speakers.get_mut(&stalled.id) {
                if ok {
                    row.not_ready_streak = 0;
                    row.reconnect_attempts = 0;
                } else {
                    row.reconnect_attempts += 1;
                }
            }
        }
    }

    requeued
}
