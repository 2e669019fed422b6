//! Address table
//!
//! Static mapping from logical peer names to `host:port` targets. Built once
//! at startup and shared read-only between request handlers.

use peer_config::{PeerEntry, RelayConfig};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A downstream `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`; the port must be a valid `u16`
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.trim().rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }

    /// Authority used in the outbound `Host` header and URL
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressTableError {
    #[error("Peer name must not be empty")]
    EmptyName,

    #[error("Peer '{0}' has an empty host")]
    EmptyHost(String),

    #[error("Peers '{first}' and '{second}' share address {target}")]
    DuplicateTarget {
        target: Target,
        first: String,
        second: String,
    },
}

/// Peer name to target mapping with reverse lookup
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    by_name: BTreeMap<String, Target>,
    by_target: HashMap<Target, String>,
}

impl AddressTable {
    /// Build from `(name, target)` pairs
    pub fn new<I, S>(entries: I) -> Result<Self, AddressTableError>
    where
        I: IntoIterator<Item = (S, Target)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (name, target) in entries {
            let name = name.into();
            if name.trim().is_empty() {
                return Err(AddressTableError::EmptyName);
            }
            if target.host.trim().is_empty() {
                return Err(AddressTableError::EmptyHost(name));
            }
            if let Some(first) = table.by_target.get(&target) {
                return Err(AddressTableError::DuplicateTarget {
                    target,
                    first: first.clone(),
                    second: name,
                });
            }
            table.by_target.insert(target.clone(), name.clone());
            table.by_name.insert(name, target);
        }
        Ok(table)
    }

    /// Build from the `[peers]` section of the configuration
    pub fn from_config(config: &RelayConfig) -> Result<Self, AddressTableError> {
        Self::new(
            config
                .peers
                .iter()
                .map(|(name, PeerEntry { host, port })| (name.clone(), Target::new(host, *port))),
        )
    }

    pub fn resolve(&self, peer_name: &str) -> Option<&Target> {
        self.by_name.get(peer_name)
    }

    pub fn reverse_resolve(&self, target: &Target) -> Option<&str> {
        self.by_target.get(target).map(String::as_str)
    }

    /// Peer named by `value`: a peer name, a `host:port`, or a host that only
    /// one peer uses
    pub fn identify(&self, value: &str) -> Option<&str> {
        let value = value.trim();
        if let Some((name, _)) = self.by_name.get_key_value(value) {
            return Some(name);
        }
        if let Some(name) = Target::parse(value).and_then(|t| self.reverse_resolve(&t)) {
            return Some(name);
        }

        let mut matches = self
            .by_name
            .iter()
            .filter(|(_, target)| target.host.eq_ignore_ascii_case(value));
        match (matches.next(), matches.next()) {
            (Some((name, _)), None) => Some(name),
            _ => None,
        }
    }

    /// Identity for a target: its peer name, or the literal `host:port`
    pub fn identity_for(&self, target: &Target) -> String {
        self.reverse_resolve(target)
            .map(str::to_string)
            .unwrap_or_else(|| target.to_string())
    }

    pub fn peer_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
