//! Group lifecycle orchestration
//!
//! The manager owns the operator-facing operations: create a group (claim
//! speakers, spawn the receiver, start the streamer), delete it (tear all
//! of that down in the reverse order), allocate receiver ports, and run
//! the keep-alive heartbeat over every live hostage.
//!
//! Locking discipline: names, ports, and reservations are settled under
//! the state mutex; everything that blocks (RAOP connects, process
//! start/stop, thread joins) runs with the lock released, on handles moved
//! out of the rows.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::{BASE_GROUP_PORT, MAX_GROUP_PORT};
use crate::error::GroupError;
use crate::group::engine;
use crate::raop::{RaopClientFactory, RaopHostage};
use crate::receiver::ReceiverProcess;
use crate::state::{AppState, BridgeState, Group, SharedHostage};

/// Heartbeat tick interval.
const HEARTBEAT_TICK: Duration = Duration::from_millis(100);

/// Pulse every this many ticks normally.
const PULSE_TICKS: u32 = 30;

/// Pulse cadence while some group sits in long silence.
const PULSE_TICKS_SILENT: u32 = 10;

/// Silence-chunk count that switches the heartbeat to the fast cadence.
const LONG_SILENCE_PULSES: u64 = 500;

/// Creates and destroys groups and keeps their hostages alive.
pub struct GroupManager {
    state: AppState,
    factory: Arc<dyn RaopClientFactory>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl GroupManager {
    pub fn new(state: AppState, factory: Arc<dyn RaopClientFactory>) -> Self {
        Self {
            state,
            factory,
            heartbeat: Mutex::new(None),
        }
    }

    /// Create a group and kick off its startup in the background. Returns
    /// the allocated receiver port once the skeletal row is registered, so
    /// the UI can show the group immediately.
    pub fn create(
        &self,
        name: &str,
        member_ids: Vec<String>,
        parent_interface: &str,
    ) -> Result<u16, GroupError> {
        if name.is_empty() {
            return Err(GroupError::EmptyName);
        }
        if member_ids.is_empty() {
            return Err(GroupError::NoMembers);
        }

        let port = {
            let mut guard = self.state.lock();
            if guard.groups.contains_key(name) {
                return Err(GroupError::AlreadyExists(name.to_string()));
            }
            for id in &member_ids {
                match guard.speakers.get(id) {
                    Some(row) if row.connected && !row.reserved => {}
                    _ => return Err(GroupError::SpeakerUnavailable(id.clone())),
                }
            }
            let port = allocate_port(&guard).ok_or(GroupError::NoFreePort)?;

            guard.groups.insert(
                name.to_string(),
                Group::new(name, port, parent_interface, member_ids.clone()),
            );
            // Claim the members while still under the lock so no
            // concurrent create can double-book a speaker.
            for id in &member_ids {
                if let Some(row) = guard.speakers.get_mut(id) {
                    row.reserved = true;
                }
            }
            port
        };

        self.state
            .set_status(format!("Group '{name}' starting up..."));

        let state = self.state.clone();
        let factory = self.factory.clone();
        let name = name.to_string();
        let iface = parent_interface.to_string();
        thread::Builder::new()
            .name(format!("create-{name}"))
            .spawn(move || start_group(state, factory, name, port, iface, member_ids))
            .expect("spawn group startup thread");

        Ok(port)
    }

    /// Tear a group down: stop the streamer and receiver, free the
    /// members, erase the row.
    pub fn delete(&self, name: &str) -> Result<(), GroupError> {
        // Phase 1: flag the streamer down and move the blocking handles
        // out of the row.
        let (streamer, process, members) = {
            let mut guard = self.state.lock();
            let group = guard
                .groups
                .get_mut(name)
                .ok_or_else(|| GroupError::NotFound(name.to_string()))?;
            group.streamer_running = false;
            (
                group.streamer.take(),
                group.process.take(),
                group.member_ids.clone(),
            )
        };

        // Phase 2: the slow part, without the lock.
        if let Some(streamer) = streamer {
            let _ = streamer.join();
        }
        if let Some(mut process) = process {
            process.stop();
        }

        // Phase 3: release the members and drop the row.
        let mut dropped: Vec<(String, SharedHostage)> = Vec::new();
        {
            let mut guard = self.state.lock();
            for id in &members {
                if let Some(row) = guard.speakers.get_mut(id) {
                    row.reserved = false;
                    row.not_ready_streak = 0;
                    row.reconnect_attempts = 0;
                    if let Some(hostage) = row.hostage.take() {
                        dropped.push((id.clone(), hostage));
                    }
                }
            }
            guard.groups.remove(name);
        }
        for (id, hostage) in dropped {
            hostage.lock().unwrap().disconnect();
            tracing::info!(target: "raop", "Disconnected (group deleted): {}", id);
        }

        self.state.set_status(format!("Group '{name}' deleted."));
        Ok(())
    }

    /// Apply a volume to every live hostage. Returns how many accepted it.
    pub fn set_volume_all(&self, volume: f32) -> usize {
        let hostages: Vec<SharedHostage> = {
            let guard = self.state.lock();
            guard
                .speakers
                .values()
                .filter_map(|row| row.hostage.clone())
                .collect()
        };
        hostages
            .into_iter()
            .filter(|h| h.lock().unwrap().set_volume(volume))
            .count()
    }

    /// Start the keep-alive heartbeat task.
    pub fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock().unwrap();
        if heartbeat.is_some() {
            return;
        }
        let state = self.state.clone();
        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let mut ticks = 0u32;
                while state.is_running() {
                    thread::sleep(HEARTBEAT_TICK);
                    ticks += 1;

                    let long_silence = {
                        let guard = state.lock();
                        guard
                            .groups
                            .values()
                            .any(|g| g.consecutive_silence_chunks > LONG_SILENCE_PULSES)
                    };
                    if !pulse_due(ticks, long_silence) {
                        continue;
                    }
                    ticks = 0;

                    let hostages: Vec<SharedHostage> = {
                        let guard = state.lock();
                        guard
                            .speakers
                            .values()
                            .filter_map(|row| row.hostage.clone())
                            .collect()
                    };
                    for hostage in hostages {
                        hostage.lock().unwrap().pulse();
                    }
                    state.request_refresh();
                }
            })
            .expect("spawn heartbeat thread");
        *heartbeat = Some(handle);
    }

    /// Delete every group and join the heartbeat. Called once on shutdown,
    /// after the run flag has been cleared.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.state.lock().groups.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.delete(&name) {
                tracing::warn!("Shutdown: failed to delete group {name}: {e}");
            }
        }
        if let Some(heartbeat) = self.heartbeat.lock().unwrap().take() {
            let _ = heartbeat.join();
        }
    }
}

/// Smallest unused receiver port in `[BASE_GROUP_PORT, MAX_GROUP_PORT)`.
fn allocate_port(state: &BridgeState) -> Option<u16> {
    (BASE_GROUP_PORT..MAX_GROUP_PORT)
        .find(|port| !state.groups.values().any(|g| g.port == *port))
}

fn pulse_due(ticks: u32, long_silence: bool) -> bool {
    ticks >= if long_silence { PULSE_TICKS_SILENT } else { PULSE_TICKS }
}

/// Background half of group creation: connect hostages, spawn the
/// receiver with its ingest callback, then start the streamer and flag
/// the members reserved. Runs on a short-lived thread so the operator's
/// UI never waits on connects.
fn start_group(
    state: AppState,
    factory: Arc<dyn RaopClientFactory>,
    name: String,
    port: u16,
    parent_interface: String,
    member_ids: Vec<String>,
) {
    // Attach hostages to the member rows (cheap, under the lock), then
    // connect them outside it.
    let mut to_connect: Vec<(String, SharedHostage)> = Vec::new();
    {
        let mut guard = state.lock();
        if !guard.groups.contains_key(&name) {
            return; // deleted before we got here
        }
        for id in &member_ids {
            let Some(row) = guard.speakers.get_mut(id) else {
                continue;
            };
            if row.hostage.is_some() {
                continue;
            }
            if row.info.ipv4.is_unspecified() || row.info.port == 0 {
                tracing::warn!(target: "raop", "Skipping {} (no usable address)", id);
                continue;
            }
            let hostage = Arc::new(Mutex::new(RaopHostage::new(
                row.info.id.clone(),
                row.info.ipv4,
                row.info.port,
                row.info.et.clone(),
                row.info.requires_auth,
                factory.clone(),
            )));
            row.hostage = Some(hostage.clone());
            to_connect.push((id.clone(), hostage));
        }
    }

    for (id, hostage) in to_connect {
        if hostage.lock().unwrap().connect() {
            tracing::info!(target: "raop", "Connected: {} (group: {})", id, name);
        } else {
            tracing::warn!(target: "raop", "Failed to connect: {} (group: {})", id, name);
        }
    }

    // The receiver feeds ingest straight from its reader thread.
    let mut process = ReceiverProcess::new(name.clone(), port, parent_interface);
    let ingest_state = state.clone();
    let ingest_group = name.clone();
    process.set_callback(Arc::new(move |data: &[u8]| {
        let mut guard = ingest_state.lock();
        if let Some(group) = guard.groups.get_mut(&ingest_group) {
            engine::ingest(group, data);
        }
    }));
    if let Err(e) = process.start() {
        // The group stays registered but silent; the operator's recovery
        // path is delete + recreate.
        tracing::error!(target: "shairport", "Receiver for '{}' failed to start: {}", name, e);
    }

    {
        let mut guard = state.lock();
        let Some(group) = guard.groups.get_mut(&name) else {
            process.stop();
            return; // deleted while we were connecting
        };
        group.process = Some(process);
        group.streamer_running = true;
        let streamer_state = state.clone();
        let streamer_factory = factory.clone();
        let streamer_name = name.clone();
        group.streamer = thread::Builder::new()
            .name(format!("streamer-{name}"))
            .spawn(move || engine::run_streamer(streamer_state, streamer_name, streamer_factory))
            .ok();
    }

    state.set_status(format!("Group '{name}' created."));
    state.request_refresh();
}
