//! Receiver process supervisor
//!
//! Spawns `shairport-sync -a <group> -p <port> -o stdout` inside the
//! group's network namespace and reads raw PCM (16-bit signed little-
//! endian stereo, 44.1 kHz) from its stdout. Every non-empty read is
//! handed to the registered callback; liveness counters let the UI tell a
//! healthy group from one whose receiver died during setup.
//!
//! There is no auto-restart: a receiver that exits leaves the group
//! registered but silent, and the operator recovers by deleting and
//! recreating the group.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::ReceiverError;
use crate::receiver::netns::NetNamespace;

/// Invoked with every freshly read PCM buffer.
pub type PcmCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Candidate locations for the receiver binary, searched in order.
const RECEIVER_CANDIDATES: &[&str] = &[
    "shiri-bridge/third_party/shairport-sync/shairport-sync",
    "../third_party/shairport-sync/shairport-sync",
    "third_party/shairport-sync/shairport-sync",
    "/usr/local/bin/shairport-sync",
];

/// Pipe read size. The receiver writes smaller bursts than this; the
/// ingest side re-chunks to RAOP geometry regardless.
const READ_BUF_BYTES: usize = 4096;

/// Liveness counters shared with the reader thread.
struct Counters {
    start: Instant,
    bytes_received: AtomicU64,
    last_chunk_bytes: AtomicU64,
    /// Milliseconds since `start` of the most recent read, −1 before the
    /// first one.
    last_chunk_millis: AtomicI64,
}

impl Counters {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            bytes_received: AtomicU64::new(0),
            last_chunk_bytes: AtomicU64::new(0),
            last_chunk_millis: AtomicI64::new(-1),
        }
    }

    fn now_millis(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    fn record(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_chunk_bytes.store(bytes as u64, Ordering::Relaxed);
        self.last_chunk_millis.store(self.now_millis(), Ordering::Relaxed);
    }

    fn millis_since_last_chunk(&self) -> i64 {
        let last = self.last_chunk_millis.load(Ordering::Relaxed);
        if last < 0 {
            return -1;
        }
        self.now_millis() - last
    }
}

/// One supervised receiver instance for one group.
pub struct ReceiverProcess {
    group_name: String,
    port: u16,
    parent_interface: String,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    callback: Option<PcmCallback>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    log_reader: Option<JoinHandle<()>>,
    netns: Option<NetNamespace>,
}

impl ReceiverProcess {
    pub fn new(group_name: impl Into<String>, port: u16, parent_interface: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            port,
            parent_interface: parent_interface.into(),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::new()),
            callback: None,
            child: None,
            reader: None,
            log_reader: None,
            netns: None,
        }
    }

    /// Register the PCM callback. Must be called before [`start`](Self::start).
    pub fn set_callback(&mut self, callback: PcmCallback) {
        self.callback = Some(callback);
    }

    /// Create the namespace, spawn the receiver inside it, and start the
    /// stdout reader.
    pub fn start(&mut self) -> Result<(), ReceiverError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ReceiverError::AlreadyRunning);
        }

        let binary = locate_in(RECEIVER_CANDIDATES).ok_or(ReceiverError::BinaryNotFound)?;
        let netns = NetNamespace::create(&self.parent_interface)?;
        let script = launch_script(&binary, netns.link_name(), &self.group_name, self.port);

        let mut child = Command::new("ip")
            .args(["netns", "exec", netns.ns_name(), "unshare", "--mount", "sh", "-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ReceiverError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            target: "shairport",
            "Receiver for '{}' starting on port {} (netns {})",
            self.group_name,
            self.port,
            netns.ns_name()
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReceiverError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let counters = self.counters.clone();
        let callback = self.callback.clone();
        let group = self.group_name.clone();
        let reader = thread::Builder::new()
            .name(format!("pcm-{}", self.group_name))
            .spawn(move || {
                let mut stdout = stdout;
                let mut buf = vec![0u8; READ_BUF_BYTES];
                while running.load(Ordering::Relaxed) {
                    match stdout.read(&mut buf) {
                        Ok(0) => {
                            tracing::warn!(target: "shairport", "Receiver for '{}' closed its pipe", group);
                            break;
                        }
                        Ok(n) => {
                            counters.record(n);
                            if let Some(cb) = &callback {
                                cb(&buf[..n]);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(target: "shairport", "Pipe read error for '{}': {}", group, e);
                            break;
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| ReceiverError::SpawnFailed(e.to_string()))?;

        // The receiver chats on stderr; keep it in the shairport pane.
        let log_reader = stderr.map(|stderr| {
            let group = self.group_name.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    tracing::debug!(target: "shairport", "[{}] {}", group, line);
                }
            })
        });

        self.child = Some(child);
        self.reader = Some(reader);
        self.log_reader = log_reader;
        self.netns = Some(netns);
        Ok(())
    }

    /// Terminate the child, reap it, join the readers, and tear down the
    /// namespace. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut child) = self.child.take() {
            let pid = child.id() as i32;
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(log_reader) = self.log_reader.take() {
            let _ = log_reader.join();
        }
        if let Some(mut netns) = self.netns.take() {
            netns.destroy();
        }
        tracing::info!(target: "shairport", "Receiver for '{}' stopped", self.group_name);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bytes_received(&self) -> u64 {
        self.counters.bytes_received.load(Ordering::Relaxed)
    }

    pub fn last_chunk_bytes(&self) -> u64 {
        self.counters.last_chunk_bytes.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last stdout read, or −1 if no data has
    /// arrived yet.
    pub fn millis_since_last_chunk(&self) -> i64 {
        self.counters.millis_since_last_chunk()
    }
}

impl Drop for ReceiverProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find the first executable candidate path.
fn locate_in(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Single-quote a string for embedding in `sh -c`.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The in-namespace launch sequence: links up, DHCP on the macvlan, a
/// private tmpfs `/run` for dbus and avahi, the timing helper, then exec
/// into the receiver with its stdout on our pipe. Each daemon start is
/// gated by `set -e` and followed by a short settle delay.
fn launch_script(binary: &Path, link: &str, group_name: &str, port: u16) -> String {
    format!(
        "set -e\n\
         ip link set lo up\n\
         ip link set {link} up\n\
         dhclient -1 {link} || udhcpc -i {link} -n -q\n\
         mount --make-rprivate /\n\
         mount -t tmpfs tmpfs /run\n\
         mkdir -p /run/dbus /run/avahi-daemon\n\
         dbus-daemon --system\n\
         sleep 0.3\n\
         avahi-daemon --daemonize --no-chroot\n\
         sleep 0.3\n\
         nqptp >/dev/null 2>&1 &\n\
         sleep 0.3\n\
         exec {bin} -a {name} -p {port} -o stdout\n",
        link = link,
        bin = sh_quote(&binary.to_string_lossy()),
        name = sh_quote(group_name),
        port = port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_locate_skips_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::File::create(&plain).unwrap().write_all(b"x").unwrap();

        let exec = dir.path().join("exec");
        std::fs::File::create(&exec).unwrap().write_all(b"x").unwrap();
        let mut perms = std::fs::metadata(&exec).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&exec, perms).unwrap();

        let plain_str = plain.to_string_lossy().to_string();
        let exec_str = exec.to_string_lossy().to_string();
        let missing = "/definitely/not/here";

        let found = locate_in(&[missing, &plain_str, &exec_str]).unwrap();
        assert_eq!(found, exec);
        assert!(locate_in(&[missing, &plain_str]).is_none());
    }

    #[test]
    fn test_sh_quote_handles_quotes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn test_launch_script_shape() {
        let script = launch_script(Path::new("/usr/local/bin/shairport-sync"), "ap2m_0a1b2c3d", "liv", 6000);
        assert!(script.starts_with("set -e\n"));
        assert!(script.contains("ip link set ap2m_0a1b2c3d up"));
        assert!(script.contains("dbus-daemon --system"));
        assert!(script.contains("avahi-daemon"));
        assert!(script.contains("nqptp"));
        assert!(script.ends_with("exec '/usr/local/bin/shairport-sync' -a 'liv' -p 6000 -o stdout\n"));
    }

    #[test]
    fn test_counters_before_first_chunk() {
        let counters = Counters::new();
        assert_eq!(counters.millis_since_last_chunk(), -1);
        assert_eq!(counters.bytes_received.load(Ordering::Relaxed), 0);

        counters.record(1408);
        assert_eq!(counters.bytes_received.load(Ordering::Relaxed), 1408);
        assert_eq!(counters.last_chunk_bytes.load(Ordering::Relaxed), 1408);
        assert!(counters.millis_since_last_chunk() >= 0);
    }
}
