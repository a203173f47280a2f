//! Discovered speaker model and TXT-record interpretation

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// One AirPlay speaker endpoint as seen on the local network.
///
/// Produced by [`Discovery`](super::Discovery); the registry owns the
/// authoritative copy and replaces it wholesale on every snapshot merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Speaker {
    /// Stable identifier, derived from the full mDNS service name.
    pub id: String,
    /// Human-readable name (service instance name when available).
    pub name: String,
    /// Advertised hostname.
    pub hostname: String,
    /// Resolved IPv4 address.
    pub ipv4: Ipv4Addr,
    /// RAOP port.
    pub port: u16,
    /// Full TXT record, keys normalized to lowercase.
    pub txt: BTreeMap<String, String>,
    /// Encryption-type token string from TXT `et`, whitespace stripped.
    pub et: String,
    /// Whether the speaker demands authentication before streaming.
    pub requires_auth: bool,
}

impl Speaker {
    /// True if the `et` token string contains the given capability token.
    pub fn et_has(&self, token: char) -> bool {
        self.et.contains(token)
    }
}

/// Strip all whitespace from an `et` token string. Some speakers pad the
/// record with spaces after the commas.
pub fn sanitize_et(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Derive the authentication requirement from TXT metadata: a password
/// flag (`pw=1`) or FairPlay in the encryption types (`'4'` in `et`).
pub fn requires_auth(et: &str, txt: &BTreeMap<String, String>) -> bool {
    let password = txt.get("pw").map(|v| v == "1").unwrap_or(false);
    password || et.contains('4')
}

/// Trim the service-type suffix off an mDNS fullname to get a display
/// name, e.g. `Living Room._raop._tcp.local.` → `Living Room`.
pub fn display_name(fullname: &str) -> String {
    let suffix = "._raop._tcp.local.";
    fullname
        .trim()
        .strip_suffix(suffix)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}
