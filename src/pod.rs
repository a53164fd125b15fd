//! Flows delivering decapsulated traffic to local pods.

use async_trait::async_trait;

use crate::config::Config;
use crate::converge::{reconcile, ConvergeReport, DesiredRuleSet};
use crate::cookie::FlowCookie;
use crate::device::Device;
use crate::error::Result;
use crate::flow::{Flow, RULE_PRIORITY, SECONDARY_TABLE};
use crate::types::{LocalPodDescriptor, MacAddr};
use crate::worker::Reconciler;

pub struct PodFlowReconciler {
    device: Device,
    bridge: String,
    ext_port: String,
    dr_mac: MacAddr,
}

impl PodFlowReconciler {
    /// `dr_mac` is the local distributed router MAC found during bootstrap.
    pub fn new(device: Device, config: &Config, dr_mac: MacAddr) -> Self {
        Self {
            device,
            bridge: config.ext_bridge.clone(),
            ext_port: config.ext_patch_port.clone(),
            dr_mac,
        }
    }

    /// One rule per pod with both an IP and a MAC: rewrite the Ethernet header
    /// as if the DR had routed the packet, then send it into the SDN side.
    pub fn desired_rules(&self, pods: &[&LocalPodDescriptor]) -> DesiredRuleSet {
        let mut desired = DesiredRuleSet::new(SECONDARY_TABLE);
        for pod in pods {
            if let Some((ip, mac)) = pod.addresses() {
                desired.insert(
                    FlowCookie::derive(&pod.qualified_name),
                    Flow::new(
                        SECONDARY_TABLE,
                        RULE_PRIORITY,
                        format!("ip,nw_dst={}", ip),
                        format!(
                            "set_field:{}->eth_src,set_field:{}->eth_dst,output:{}",
                            self.dr_mac, mac, self.ext_port
                        ),
                    ),
                );
            }
        }
        desired
    }
}

#[async_trait]
impl Reconciler for PodFlowReconciler {
    type Descriptor = LocalPodDescriptor;

    fn kind(&self) -> &'static str {
        "pod"
    }

    async fn converge(&self, members: &[&LocalPodDescriptor]) -> Result<ConvergeReport> {
        reconcile(&self.device, &self.bridge, &self.desired_rules(members)).await
    }
}
