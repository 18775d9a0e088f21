//! Subject Alternative Name parsing.
//!
//! Caller input such as `"device1.local, 10.0.0.5 device1.lan"` is split on
//! commas and whitespace, each token is classified as an IP literal or a DNS
//! name, normalised, and de-duplicated while keeping first-seen order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
}

impl SanEntry {
    /// Classify and normalise one token. Returns `None` for blank input.
    pub fn parse(token: &str) -> Option<SanEntry> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        if let Ok(ip) = token.parse::<IpAddr>() {
            return Some(SanEntry::Ip(ip));
        }
        // [::1] style literals are still addresses
        if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if let Ok(ip) = inner.parse::<IpAddr>() {
                return Some(SanEntry::Ip(ip));
            }
        }
        let dns = token.trim_end_matches('.').to_ascii_lowercase();
        if dns.is_empty() {
            return None;
        }
        Some(SanEntry::Dns(dns))
    }
}

impl fmt::Display for SanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanEntry::Dns(name) => write!(f, "DNS:{}", name),
            SanEntry::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

/// Ordered, duplicate-free list of SAN entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanList {
    entries: Vec<SanEntry>,
}

impl SanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse free-form caller input.
    pub fn parse(input: &str) -> SanList {
        let mut list = SanList::new();
        for token in input.split(|c: char| c == ',' || c.is_whitespace()) {
            if let Some(entry) = SanEntry::parse(token) {
                list.push(entry);
            }
        }
        list
    }

    /// Append unless an equal entry is already present.
    pub fn push(&mut self, entry: SanEntry) -> bool {
        if self.entries.contains(&entry) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Put `entry` first, moving it there if it was already listed.
    pub fn push_front(&mut self, entry: SanEntry) {
        self.entries.retain(|e| e != &entry);
        self.entries.insert(0, entry);
    }

    pub fn entries(&self) -> &[SanEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn dns_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                SanEntry::Dns(name) => Some(name.clone()),
                SanEntry::Ip(_) => None,
            })
            .collect()
    }

    pub fn ip_addresses(&self) -> Vec<IpAddr> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                SanEntry::Ip(ip) => Some(*ip),
                SanEntry::Dns(_) => None,
            })
            .collect()
    }
}
