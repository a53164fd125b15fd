//! Data structures shared by the watch source, the workers and the
//! reconcilers.
//!
//! Descriptors are the agent's view of a cluster object, reduced to the
//! fields that decide which flows it needs. They are rebuilt from the object
//! on every notification and never hold device state.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use sha2::{Digest, Sha256};

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Bare hex form used by `load:0x...` actions.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Builds a locally administered unicast address from `seed`. The same
    /// seed always yields the same address.
    pub fn derive_local(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&digest[..6]);
        octets[0] = (octets[0] & 0xfe) | 0x02;
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address '{0}'")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMacError(s.to_string());
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut octets = [0u8; 6];
        let mut parts = s.split(sep);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(MacAddr(octets))
    }
}

/// Anything stored in a worker's membership map.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// A cluster node as seen by the node reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNodeDescriptor {
    pub name: String,
    pub is_local: bool,
    pub overlay_subnet: Option<Ipv4Net>,
    pub overlay_mac: Option<MacAddr>,
    pub node_ip: Option<Ipv4Addr>,
}

impl RemoteNodeDescriptor {
    /// Returns the subnet and MAC when this node needs hybrid overlay flows.
    ///
    /// The decision rests only on the annotations being present, never on the
    /// node's operating system.
    pub fn hybrid_overlay(&self) -> Option<(Ipv4Net, MacAddr)> {
        if self.is_local {
            return None;
        }
        Some((self.overlay_subnet?, self.overlay_mac?))
    }
}

impl Keyed for RemoteNodeDescriptor {
    fn key(&self) -> &str {
        &self.name
    }
}

/// A pod scheduled on the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPodDescriptor {
    /// `<namespace>_<name>`
    pub qualified_name: String,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<MacAddr>,
}

impl LocalPodDescriptor {
    pub fn key_for(namespace: &str, name: &str) -> String {
        format!("{}_{}", namespace, name)
    }

    pub fn addresses(&self) -> Option<(Ipv4Addr, MacAddr)> {
        Some((self.ip?, self.mac?))
    }
}

impl Keyed for LocalPodDescriptor {
    fn key(&self) -> &str {
        &self.qualified_name
    }
}

/// A change delivered by the watch source for one object kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<D> {
    /// The object was created or updated; carries its full current state.
    Apply(D),
    /// The object with this key is gone.
    Delete(String),
    /// Complete membership after a (re)list. Replaces everything known so far.
    Resync(Vec<D>),
}
