//! OpenFlow rule model.
//!
//! A [`Flow`] renders to the exact text handed to `ovs-ofctl add-flow`.
//! [`InstalledFlow::parse`] reads one line of `ovs-ofctl dump-flows` output.
//! Both reduce to a [`FlowSignature`] so a desired rule can be compared with
//! what the bridge reports.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use crate::cookie::FlowCookie;

/// Table holding ARP responders, encapsulation and the hand-off to pods.
pub const PRIMARY_TABLE: u8 = 0;
/// Table holding per-pod MAC rewrite rules.
pub const SECONDARY_TABLE: u8 = 10;

/// Priority of the unconditional drop that ends each table.
pub const BASE_PRIORITY: u16 = 0;
/// Priority of every other rule.
pub const RULE_PRIORITY: u16 = 100;

/// Fields in a dump line that describe runtime state, not the rule.
const DUMP_ONLY_FIELDS: &[&str] = &[
    "duration",
    "n_packets",
    "n_bytes",
    "idle_age",
    "hard_age",
    "idle_timeout",
    "hard_timeout",
    "reset_counts",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub cookie: Option<FlowCookie>,
    pub table: u8,
    pub priority: u16,
    /// Comma-separated match fields, possibly empty.
    pub matches: String,
    pub actions: String,
}

impl Flow {
    pub fn new(table: u8, priority: u16, matches: impl Into<String>, actions: impl Into<String>) -> Self {
        Self {
            cookie: None,
            table,
            priority,
            matches: matches.into(),
            actions: actions.into(),
        }
    }

    /// Lowest-priority drop for `table`.
    pub fn drop_all(table: u8) -> Self {
        Self::new(table, BASE_PRIORITY, "", "drop")
    }

    pub fn with_cookie(mut self, cookie: FlowCookie) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn signature(&self) -> FlowSignature {
        FlowSignature::new(self.priority, self.matches.split(','), &self.actions)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cookie) = self.cookie {
            write!(f, "cookie={},", cookie)?;
        }
        write!(f, "table={},priority={},", self.table, self.priority)?;
        if !self.matches.is_empty() {
            write!(f, "{},", self.matches)?;
        }
        write!(f, "actions={}", self.actions)
    }
}

/// Order-insensitive identity of a rule's priority, match and actions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowSignature {
    priority: u16,
    matches: BTreeSet<String>,
    actions: String,
}

impl FlowSignature {
    fn new<'a>(priority: u16, matches: impl Iterator<Item = &'a str>, actions: &str) -> Self {
        Self {
            priority,
            matches: matches
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(canonical_match)
                .collect(),
            actions: split_actions(&unquote(actions.trim()))
                .into_iter()
                .map(canonical_action)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// True when both rules occupy the same slot, i.e. adding one replaces
    /// the other.
    pub fn same_match(&self, other: &FlowSignature) -> bool {
        self.priority == other.priority && self.matches == other.matches
    }
}

/// A rule as reported by a table dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFlow {
    pub cookie: FlowCookie,
    pub table: Option<u8>,
    pub signature: FlowSignature,
}

impl InstalledFlow {
    /// Parses one dump line, e.g.
    ///
    /// ```text
    ///  cookie=0x7fdcde17, duration=29398.539s, table=10, n_packets=0, n_bytes=0, priority=100,ip,nw_dst=1.2.3.5 actions=output:ext
    /// ```
    ///
    /// Returns `None` for headers, blank lines and anything without a
    /// readable cookie.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (head, actions) = line.split_once(" actions=")?;

        let mut cookie = None;
        let mut table = None;
        let mut priority = None;
        let mut matches = Vec::new();
        for field in head.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (name, value) = match field.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (field, None),
            };
            match (name, value) {
                ("cookie", Some(v)) => cookie = Some(v.parse::<FlowCookie>().ok()?),
                ("table", Some(v)) => table = Some(v.parse::<u8>().ok()?),
                ("priority", Some(v)) => priority = Some(v.parse::<u16>().ok()?),
                (name, _) if DUMP_ONLY_FIELDS.contains(&name) => {}
                _ => matches.push(field),
            }
        }

        Some(Self {
            cookie: cookie?,
            table,
            // OpenFlow default priority when the dump omits it
            signature: FlowSignature::new(priority.unwrap_or(32768), matches.into_iter(), actions),
        })
    }
}

fn unquote(s: &str) -> String {
    s.replace('"', "")
}

/// OVS prints host matches without the `/32`.
fn canonical_match(field: &str) -> String {
    let field = unquote(field);
    match field.strip_suffix("/32") {
        Some(host) if host.contains('=') => host.to_string(),
        _ => field,
    }
}

/// Splits an action list on the commas that separate actions, leaving the
/// ones inside `resubmit(,10)` or `NXM_NX_TUN_ID[0..31]` alone.
fn split_actions(actions: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in actions.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&actions[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&actions[start..]);
    parts.into_iter().map(str::trim).filter(|a| !a.is_empty()).collect()
}

/// Rewrites one action into the form `ovs-ofctl dump-flows` prints it in.
///
/// `set_field` on the Ethernet addresses is listed as `mod_dl_src` and
/// `mod_dl_dst`, `set_field` on `tun_dst` as a hex `load` into
/// `NXM_NX_TUN_IPV4_DST[]`, and `load` immediates in hex without leading
/// zeros.
fn canonical_action(action: &str) -> String {
    if let Some((value, field)) = action.strip_prefix("set_field:").and_then(|a| a.rsplit_once("->")) {
        match field {
            "eth_src" => return format!("mod_dl_src:{}", value.to_ascii_lowercase()),
            "eth_dst" => return format!("mod_dl_dst:{}", value.to_ascii_lowercase()),
            "tun_dst" => {
                if let Ok(ip) = value.parse::<Ipv4Addr>() {
                    return format!("load:{:#x}->NXM_NX_TUN_IPV4_DST[]", u32::from(ip));
                }
            }
            _ => {}
        }
    }
    if let Some((value, field)) = action.strip_prefix("load:").and_then(|a| a.split_once("->")) {
        if let Some(n) = parse_immediate(value) {
            return format!("load:{:#x}->{}", n, field);
        }
    }
    for prefix in ["mod_dl_src:", "mod_dl_dst:"] {
        if let Some(mac) = action.strip_prefix(prefix) {
            return format!("{}{}", prefix, mac.to_ascii_lowercase());
        }
    }
    action.to_string()
}

fn parse_immediate(value: &str) -> Option<u128> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
