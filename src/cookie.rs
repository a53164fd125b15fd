//! Stable flow identities.
//!
//! Every rule this agent installs carries a cookie derived from the key of the
//! cluster object it belongs to. The cookie is the first four bytes of the
//! SHA-256 digest of the key, read big-endian, so any agent build that shares
//! this derivation agrees on which rules belong to which node or pod without
//! keeping any record of what was installed.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Numeric tag attached to a flow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowCookie(u32);

impl FlowCookie {
    /// Cookie carried by base rules installed during bootstrap.
    pub const BASE: FlowCookie = FlowCookie(0);

    /// Mask that selects exactly the bits a derived cookie occupies.
    pub const MASK: u32 = 0xffff_ffff;

    /// Derives the cookie for a cluster object key.
    pub fn derive(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        // zero is reserved for base rules
        FlowCookie(value.max(1))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_base(self) -> bool {
        self == Self::BASE
    }
}

impl fmt::Display for FlowCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid flow cookie '{0}'")]
pub struct ParseCookieError(String);

impl FromStr for FlowCookie {
    type Err = ParseCookieError;

    /// Parses the `0x...` form printed by flow dumps. Values wider than 32 bits
    /// were not written by this agent and are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseCookieError(s.to_string()))?;
        u32::from_str_radix(digits, 16)
            .map(FlowCookie)
            .map_err(|_| ParseCookieError(s.to_string()))
    }
}
