use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Standard VXLAN UDP port; anything else is passed to the tunnel port.
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Tunnel id stamped on every packet this agent encapsulates.
pub const DEFAULT_TUNNEL_KEY: u32 = 4097;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node_name: String,
    pub int_bridge: String,
    pub ext_bridge: String,
    pub int_patch_port: String,
    pub ext_patch_port: String,
    pub tunnel_port: String,
    pub vxlan_dst_port: u16,
    pub tunnel_key: u32,
    pub command_timeout_secs: u64,
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            int_bridge: "br-int".into(),
            ext_bridge: "br-ext".into(),
            int_patch_port: "int".into(),
            ext_patch_port: "ext".into(),
            tunnel_port: "ext-vxlan".into(),
            vxlan_dst_port: DEFAULT_VXLAN_PORT,
            tunnel_key: DEFAULT_TUNNEL_KEY,
            command_timeout_secs: 15,
            queue_depth: 128,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("hybrid-overlay.toml"))
            .merge(Json::file("hybrid-overlay.json"))
            .merge(Env::prefixed("HYBRID_OVERLAY_"))
            .extract()
            .map_err(|e| Error::Config(format!("failed to load configuration: {}", e)))?;

        config.resolve(std::env::var("NODE_NAME").ok())
    }

    /// Fills in the node name from the pod environment and validates the result.
    fn resolve(mut self, node_env: Option<String>) -> Result<Self> {
        if self.node_name.is_empty() {
            if let Some(name) = node_env {
                self.node_name = name.trim().to_string();
            }
        }
        if self.node_name.is_empty() {
            return Err(Error::Config(
                "node name must be set via HYBRID_OVERLAY_NODE_NAME or NODE_NAME".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::Config("command_timeout_secs must be at least 1".into()));
        }
        Ok(self)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Name of the logical switch port that carries the local DR MAC and IP.
    pub fn local_port_name(&self) -> String {
        format!("int-{}", self.node_name)
    }

    #[cfg(test)]
    pub(crate) fn for_node(name: &str) -> Self {
        Self {
            node_name: name.into(),
            ..Self::default()
        }
    }
}
