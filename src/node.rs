//! Flows towards remote hybrid overlay nodes.
//!
//! Each remote node with an overlay subnet and MAC gets two rules in the
//! primary table, both tagged with the node's cookie: an ARP responder for
//! any address in its subnet, and a rule that tunnels traffic for the subnet
//! to the node's IP.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::debug;

use crate::config::Config;
use crate::converge::{reconcile, ConvergeReport, DesiredRuleSet};
use crate::cookie::FlowCookie;
use crate::device::Device;
use crate::error::Result;
use crate::flow::{Flow, PRIMARY_TABLE, RULE_PRIORITY};
use crate::types::{MacAddr, RemoteNodeDescriptor};
use crate::worker::Reconciler;

pub struct NodeFlowReconciler {
    device: Device,
    bridge: String,
    ext_port: String,
    tunnel_port: String,
    tunnel_key: u32,
}

impl NodeFlowReconciler {
    pub fn new(device: Device, config: &Config) -> Self {
        Self {
            device,
            bridge: config.ext_bridge.clone(),
            ext_port: config.ext_patch_port.clone(),
            tunnel_port: config.tunnel_port.clone(),
            tunnel_key: config.tunnel_key,
        }
    }

    pub fn desired_rules(&self, nodes: &[&RemoteNodeDescriptor]) -> DesiredRuleSet {
        let mut desired = DesiredRuleSet::new(PRIMARY_TABLE);
        for node in nodes {
            let Some((subnet, mac)) = node.hybrid_overlay() else {
                continue;
            };
            let cookie = FlowCookie::derive(&node.name);
            desired.insert(cookie, self.arp_responder(subnet, mac));
            match node.node_ip {
                Some(ip) => desired.insert(cookie, self.encapsulation(subnet, mac, ip)),
                None => debug!("Node {} has no internal IP yet, skipping tunnel rule", node.name),
            }
        }
        desired
    }

    /// Replies to ARP for any address in `subnet` with `mac`. The requested
    /// address is swapped into the sender field through reg0, so one rule
    /// covers the whole subnet.
    fn arp_responder(&self, subnet: Ipv4Net, mac: MacAddr) -> Flow {
        Flow::new(
            PRIMARY_TABLE,
            RULE_PRIORITY,
            format!("arp,in_port={},arp_tpa={}", self.ext_port, subnet),
            format!(
                "move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],mod_dl_src:{mac},\
                 load:0x2->NXM_OF_ARP_OP[],\
                 move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
                 load:0x{mac_hex}->NXM_NX_ARP_SHA[],\
                 move:NXM_OF_ARP_TPA[]->NXM_NX_REG0[],\
                 move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
                 move:NXM_NX_REG0[]->NXM_OF_ARP_SPA[],\
                 IN_PORT",
                mac = mac,
                mac_hex = mac.to_hex(),
            ),
        )
    }

    fn encapsulation(&self, subnet: Ipv4Net, mac: MacAddr, node_ip: std::net::Ipv4Addr) -> Flow {
        Flow::new(
            PRIMARY_TABLE,
            RULE_PRIORITY,
            format!("ip,nw_dst={}", subnet),
            format!(
                "load:{}->NXM_NX_TUN_ID[0..31],set_field:{}->tun_dst,set_field:{}->eth_dst,output:{}",
                self.tunnel_key, node_ip, mac, self.tunnel_port
            ),
        )
    }
}

#[async_trait]
impl Reconciler for NodeFlowReconciler {
    type Descriptor = RemoteNodeDescriptor;

    fn kind(&self) -> &'static str {
        "node"
    }

    async fn converge(&self, members: &[&RemoteNodeDescriptor]) -> Result<ConvergeReport> {
        reconcile(&self.device, &self.bridge, &self.desired_rules(members)).await
    }
}
