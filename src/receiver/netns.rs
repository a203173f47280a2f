//! Network namespace and macvlan lifecycle
//!
//! AirPlay 2 wants one mDNS identity per receiver instance, so each group
//! gets a fresh network namespace with a macvlan link hanging off the
//! host NIC the operator picked. Setup and teardown shell out to `ip(8)`;
//! names are `ap2n_<hex32>` / `ap2m_<hex32>` with the hex digits taken
//! from the low 32 bits of a wall-clock nanosecond timestamp.

use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ReceiverError;

/// A created namespace + macvlan pair. Destroyed explicitly or on drop.
pub struct NetNamespace {
    ns_name: String,
    link_name: String,
    destroyed: bool,
}

impl NetNamespace {
    /// Create `ap2n_<hex32>` and move a new macvlan over
    /// `parent_interface` into it.
    pub fn create(parent_interface: &str) -> Result<Self, ReceiverError> {
        let tag = unique_tag();
        let ns_name = format!("ap2n_{tag}");
        let link_name = format!("ap2m_{tag}");

        run_ip(&["netns", "add", &ns_name])?;

        let setup = [
            vec!["link", "add", &link_name, "link", parent_interface, "type", "macvlan", "mode", "bridge"],
            vec!["link", "set", &link_name, "netns", &ns_name],
        ];
        for args in setup {
            if let Err(e) = run_ip(&args) {
                // Half-built namespace is useless; take it back down.
                let _ = run_ip(&["link", "delete", &link_name]);
                let _ = run_ip(&["netns", "delete", &ns_name]);
                return Err(e);
            }
        }

        tracing::info!(
            target: "shairport",
            "Created namespace {} with macvlan {} on {}",
            ns_name,
            link_name,
            parent_interface
        );
        Ok(Self {
            ns_name,
            link_name,
            destroyed: false,
        })
    }

    pub fn ns_name(&self) -> &str {
        &self.ns_name
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    /// Tear the namespace and link down. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        // Deleting the namespace releases the macvlan inside it; the link
        // delete covers the case where the move never happened.
        let _ = run_ip(&["netns", "delete", &self.ns_name]);
        let _ = run_ip(&["link", "delete", &self.link_name]);
        tracing::info!(target: "shairport", "Destroyed namespace {}", self.ns_name);
    }
}

impl Drop for NetNamespace {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_ip(args: &[&str]) -> Result<(), ReceiverError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| ReceiverError::NamespaceSetup(format!("ip {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(ReceiverError::NamespaceSetup(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Eight hex digits from the low 32 bits of the wall clock, nanosecond
/// resolution, so two groups created back to back get distinct names.
fn unique_tag() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:08x}", (nanos & 0xffff_ffff) as u32)
}

/// Candidate parent interfaces for a new group: every non-loopback NIC
/// currently known to the kernel.
pub fn list_parent_interfaces() -> Vec<String> {
    let mut interfaces = Vec::new();
    let entries = match std::fs::read_dir("/sys/class/net") {
        Ok(entries) => entries,
        Err(_) => return interfaces,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name != "lo" && !name.is_empty() {
            interfaces.push(name);
        }
    }
    interfaces.sort();
    interfaces
}
