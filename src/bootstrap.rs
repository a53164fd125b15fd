//! One-time setup of the external bridge.
//!
//! Brings `br-ext` from absent or arbitrary state to the baseline the
//! reconcilers build on: the bridge itself, the patch pair to the integration
//! bridge, the VXLAN port, the local ARP responder, the hand-off into the pod
//! table and the drop rule at the bottom of both tables. Every step can be
//! repeated against an already configured bridge.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::{debug, info};

use crate::config::{Config, DEFAULT_VXLAN_PORT};
use crate::device::{Device, Session};
use crate::error::{Error, Result};
use crate::flow::{Flow, PRIMARY_TABLE, RULE_PRIORITY, SECONDARY_TABLE};
use crate::types::MacAddr;

/// Addresses of the local node on the hybrid overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetwork {
    /// Overlay subnet assigned to this node.
    pub subnet: Ipv4Net,
    /// Distributed router MAC on the local segment.
    pub dr_mac: MacAddr,
    /// Address answered by the local ARP responder.
    pub ip: Ipv4Addr,
    /// Hardware address pinned on the external bridge.
    pub bridge_mac: MacAddr,
}

/// Runs the full bootstrap sequence. Any error is fatal to the agent.
pub async fn bootstrap(device: &Device, config: &Config) -> Result<LocalNetwork> {
    let node = config.node_name.as_str();
    let ext = config.ext_bridge.as_str();
    let session = device.session().await;
    info!("Bootstrapping external bridge {} for node {}", ext, node);

    let subnet = local_subnet(&session, node).await?;
    let (dr_mac, ip) = local_port_addresses(&session, &config.local_port_name()).await?;
    debug!("Local subnet {}, DR MAC {}, IP {}", subnet, dr_mac, ip);

    tolerate_exists(
        session
            .vsctl(&["--may-exist", "add-br", ext, "--", "set", "Bridge", ext, "fail_mode=secure"])
            .await,
    )?;

    let bridge_mac = bridge_mac(&session, config).await?;
    let hwaddr = format!("other-config:hwaddr={}", bridge_mac);
    session.vsctl(&["set", "bridge", ext, &hwaddr]).await?;
    session.ip(&["link", "set", ext, "up"]).await?;

    let (int_port, ext_port) = (config.int_patch_port.as_str(), config.ext_patch_port.as_str());
    let iface_id = format!("external-ids:iface-id={}", config.local_port_name());
    let int_peer = format!("options:peer={}", ext_port);
    let ext_peer = format!("options:peer={}", int_port);
    tolerate_exists(
        session
            .vsctl(&[
                "--may-exist", "add-port", config.int_bridge.as_str(), int_port,
                "--", "--may-exist", "add-port", ext, ext_port,
                "--", "set", "Interface", int_port, "type=patch", &int_peer, &iface_id,
                "--", "set", "Interface", ext_port, "type=patch", &ext_peer,
            ])
            .await,
    )?;

    session.add_flow(ext, &Flow::drop_all(PRIMARY_TABLE)).await?;
    session.add_flow(ext, &local_arp_responder(ext_port, ip, dr_mac)).await?;

    let tunnel = config.tunnel_port.as_str();
    let vxlan_type = "type=vxlan";
    let dst_port = format!("options:dst_port={}", config.vxlan_dst_port);
    let mut tunnel_args = vec![
        "--may-exist", "add-port", ext, tunnel,
        "--", "set", "interface", tunnel, vxlan_type,
        r#"options:remote_ip="flow""#, r#"options:key="flow""#,
    ];
    if config.vxlan_dst_port != DEFAULT_VXLAN_PORT {
        tunnel_args.push(&dst_port);
    }
    tolerate_exists(session.vsctl(&tunnel_args).await)?;

    session.add_flow(ext, &tunnel_to_pods(tunnel, subnet, dr_mac)).await?;
    session.add_flow(ext, &Flow::drop_all(SECONDARY_TABLE)).await?;

    info!("External bridge {} ready", ext);
    Ok(LocalNetwork {
        subnet,
        dr_mac,
        ip,
        bridge_mac,
    })
}

fn tolerate_exists(result: Result<String>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => {
            debug!("Ignoring: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Strips the brackets and quotes OVSDB puts around values.
fn ovsdb_value(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '[' || c == ']').trim().trim_matches('"').trim()
}

async fn local_subnet(session: &Session<'_>, node: &str) -> Result<Ipv4Net> {
    let what = format!("subnet of logical switch {}", node);
    let raw = session
        .nbctl(&["get", "logical_switch", node, "other-config:subnet"])
        .await
        .map_err(|e| Error::metadata(&what, e))?;
    ovsdb_value(&raw)
        .parse::<Ipv4Net>()
        .map_err(|e| Error::metadata(&what, format!("'{}': {}", raw.trim(), e)))
}

async fn local_port_addresses(session: &Session<'_>, port: &str) -> Result<(MacAddr, Ipv4Addr)> {
    let what = format!("addresses of logical switch port {}", port);
    let raw = session
        .nbctl(&["--if-exists", "get", "logical_switch_port", port, "dynamic_addresses", "addresses"])
        .await
        .map_err(|e| Error::metadata(&what, e))?;
    parse_port_addresses(&raw).ok_or_else(|| Error::metadata(&what, format!("no MAC/IP pair in '{}'", raw.trim())))
}

/// Picks the first `"<mac> <ip>"` entry out of the two OVSDB columns.
fn parse_port_addresses(raw: &str) -> Option<(MacAddr, Ipv4Addr)> {
    raw.lines().find_map(|line| {
        let mut fields = ovsdb_value(line).split_whitespace();
        let mac = fields.next()?.parse().ok()?;
        let ip = fields.next()?.parse().ok()?;
        Some((mac, ip))
    })
}

/// Reads the bridge's current MAC, or derives a stable one from the node name.
async fn bridge_mac(session: &Session<'_>, config: &Config) -> Result<MacAddr> {
    let ext = config.ext_bridge.as_str();
    let raw = session
        .vsctl(&["--if-exists", "get", "interface", ext, "mac_in_use"])
        .await?;
    match ovsdb_value(&raw).parse::<MacAddr>() {
        Ok(mac) => Ok(mac),
        Err(_) => {
            let mac = MacAddr::derive_local(&format!("{}/{}", ext, config.node_name));
            info!("Bridge {} has no MAC yet, assigning {}", ext, mac);
            Ok(mac)
        }
    }
}

/// Answers ARP requests for the local overlay IP with the DR MAC.
fn local_arp_responder(ext_port: &str, ip: Ipv4Addr, dr_mac: MacAddr) -> Flow {
    Flow::new(
        PRIMARY_TABLE,
        RULE_PRIORITY,
        format!("in_port={},arp,arp_tpa={}", ext_port, ip),
        format!(
            "move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],mod_dl_src:{mac},\
             load:0x2->NXM_OF_ARP_OP[],\
             move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
             move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
             load:0x{mac_hex}->NXM_NX_ARP_SHA[],\
             load:0x{ip_hex}->NXM_OF_ARP_SPA[],\
             IN_PORT",
            mac = dr_mac,
            mac_hex = dr_mac.to_hex(),
            ip_hex = hex::encode(ip.octets()),
        ),
    )
}

/// Sends decapsulated traffic for local pods on to the pod table.
fn tunnel_to_pods(tunnel_port: &str, subnet: Ipv4Net, dr_mac: MacAddr) -> Flow {
    Flow::new(
        PRIMARY_TABLE,
        RULE_PRIORITY,
        format!("in_port={},ip,nw_dst={},dl_dst={}", tunnel_port, subnet, dr_mac),
        format!("goto_table:{}", SECONDARY_TABLE),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::fake::FakeExec;

    pub const TEST_BRIDGE_MAC: &str = "11:22:33:44:55:66";
    pub const TEST_DR_MAC: &str = "00:00:00:7a:af:04";
    pub const TEST_NODE_SUBNET: &str = "1.2.3.0/24";
    pub const TEST_NODE_IP: &str = "1.2.3.3";

    /// Scripts the commands of a bootstrap run against a fresh bridge.
    pub fn expect_bootstrap(fake: &FakeExec, node: &str) {
        fake.expect(
            format!("ovn-nbctl get logical_switch {} other-config:subnet", node),
            format!("\"{}\"", TEST_NODE_SUBNET),
        );
        fake.expect(
            format!("ovn-nbctl --if-exists get logical_switch_port int-{} dynamic_addresses addresses", node),
            format!("\"{} {}\"\n[dynamic]", TEST_DR_MAC, TEST_NODE_IP),
        );
        fake.expect_ok(&["ovs-vsctl --may-exist add-br br-ext -- set Bridge br-ext fail_mode=secure"]);
        fake.expect("ovs-vsctl --if-exists get interface br-ext mac_in_use", format!("\"{}\"", TEST_BRIDGE_MAC));
        fake.expect_ok(&[
            format!("ovs-vsctl set bridge br-ext other-config:hwaddr={}", TEST_BRIDGE_MAC),
            "ip link set br-ext up".to_string(),
            format!(
                "ovs-vsctl --may-exist add-port br-int int -- --may-exist add-port br-ext ext -- set Interface int type=patch options:peer=ext external-ids:iface-id=int-{} -- set Interface ext type=patch options:peer=int",
                node
            ),
            "ovs-ofctl add-flow br-ext table=0,priority=0,actions=drop".to_string(),
            format!(
                "ovs-ofctl add-flow br-ext table=0,priority=100,in_port=ext,arp,arp_tpa={ip},actions=move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],mod_dl_src:{mac},load:0x2->NXM_OF_ARP_OP[],move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],load:0x{raw}->NXM_NX_ARP_SHA[],load:0x01020303->NXM_OF_ARP_SPA[],IN_PORT",
                ip = TEST_NODE_IP,
                mac = TEST_DR_MAC,
                raw = TEST_DR_MAC.replace(':', ""),
            ),
            r#"ovs-vsctl --may-exist add-port br-ext ext-vxlan -- set interface ext-vxlan type=vxlan options:remote_ip="flow" options:key="flow""#.to_string(),
            format!(
                "ovs-ofctl add-flow br-ext table=0,priority=100,in_port=ext-vxlan,ip,nw_dst={},dl_dst={},actions=goto_table:10",
                TEST_NODE_SUBNET, TEST_DR_MAC
            ),
            "ovs-ofctl add-flow br-ext table=10,priority=0,actions=drop".to_string(),
        ]);
    }

    #[tokio::test]
    async fn sets_up_fresh_bridge() {
        let fake = FakeExec::new();
        expect_bootstrap(&fake, "mynode");

        let local = bootstrap(&Device::new(fake.clone()), &Config::for_node("mynode"))
            .await
            .expect("bootstrap succeeds");

        fake.assert_done();
        assert_eq!(local.subnet, TEST_NODE_SUBNET.parse::<Ipv4Net>().unwrap());
        assert_eq!(local.dr_mac, TEST_DR_MAC.parse::<MacAddr>().unwrap());
        assert_eq!(local.ip, TEST_NODE_IP.parse::<Ipv4Addr>().unwrap());
        assert_eq!(local.bridge_mac, TEST_BRIDGE_MAC.parse::<MacAddr>().unwrap());
    }

    #[tokio::test]
    async fn missing_subnet_is_fatal() {
        let fake = FakeExec::new();
        fake.expect_err(
            "ovn-nbctl get logical_switch mynode other-config:subnet",
            "ovn-nbctl: no key \"subnet\" in Logical_Switch record \"mynode\" column other_config",
        );

        let err = bootstrap(&Device::new(fake.clone()), &Config::for_node("mynode"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Metadata { .. }));
        fake.assert_done();
    }

    #[tokio::test]
    async fn existing_bridge_is_tolerated_but_other_failures_are_not() {
        let fake = FakeExec::new();
        fake.expect("ovn-nbctl get logical_switch mynode other-config:subnet", TEST_NODE_SUBNET);
        fake.expect(
            "ovn-nbctl --if-exists get logical_switch_port int-mynode dynamic_addresses addresses",
            format!("[]\n[\"{} {}\"]", TEST_DR_MAC, TEST_NODE_IP),
        );
        fake.expect_err(
            "ovs-vsctl --may-exist add-br br-ext -- set Bridge br-ext fail_mode=secure",
            "a bridge named br-ext already exists",
        );
        fake.expect("ovs-vsctl --if-exists get interface br-ext mac_in_use", "");
        let derived = MacAddr::derive_local("br-ext/mynode");
        fake.expect_err(
            format!("ovs-vsctl set bridge br-ext other-config:hwaddr={}", derived),
            "database connection failed",
        );

        let err = bootstrap(&Device::new(fake.clone()), &Config::for_node("mynode"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
        fake.assert_done();
    }

    #[test]
    fn port_addresses_come_from_either_column() {
        let expected: Option<(MacAddr, Ipv4Addr)> =
            Some((TEST_DR_MAC.parse().unwrap(), TEST_NODE_IP.parse().unwrap()));
        assert_eq!(parse_port_addresses("[]\n[\"00:00:00:7a:af:04 1.2.3.3\"]"), expected);
        assert_eq!(parse_port_addresses("\"00:00:00:7a:af:04 1.2.3.3\"\n[dynamic]"), expected);
        assert_eq!(parse_port_addresses("[]\n[dynamic]"), None);
    }
}
