//! Kubernetes watch source.
//!
//! Nodes and pods are watched with `kube::runtime::watcher`. The watcher's
//! initial list (`Init` .. `InitDone`) is folded into a single `Resync`, so a
//! relist after a dropped connection also replaces the worker's membership
//! and catches deletions missed while disconnected.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::WatchSource;
use crate::error::{Error, Result};
use crate::types::{LocalPodDescriptor, MacAddr, Notification, RemoteNodeDescriptor};

/// Overlay subnet of a node reached through the hybrid overlay.
pub const NODE_SUBNET_ANNOTATION: &str = "k8s.ovn.org/hybrid-overlay-node-subnet";
/// Distributed router MAC of such a node.
pub const NODE_DR_MAC_ANNOTATION: &str = "k8s.ovn.org/hybrid-overlay-distributed-router-gateway-mac";
/// Per-network addresses assigned to a pod by the SDN.
pub const POD_NETWORKS_ANNOTATION: &str = "k8s.ovn.org/pod-networks";

const DEFAULT_NETWORK: &str = "default";

pub struct KubeWatchSource {
    client: Client,
    node_name: String,
}

impl KubeWatchSource {
    pub fn new(client: Client, node_name: String) -> Self {
        Self { client, node_name }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn watch_nodes(&self, tx: mpsc::Sender<Notification<RemoteNodeDescriptor>>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let local = self.node_name.as_str();
        info!("Starting node watcher");

        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        forward(
            "node",
            stream,
            &tx,
            |node: &Node| Some(node_descriptor(node, local)),
            |node: &Node| node.name_any(),
        )
        .await
    }

    async fn watch_pods(&self, tx: mpsc::Sender<Notification<LocalPodDescriptor>>) -> Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let local = self.node_name.as_str();
        let selector = format!("spec.nodeName={}", local);
        info!("Starting pod watcher for {}", selector);

        let stream = watcher::watcher(api, watcher::Config::default().fields(&selector)).default_backoff();
        forward("pod", stream, &tx, |pod: &Pod| pod_descriptor(pod, local), pod_key).await
    }
}

/// Translates watcher events into notifications until the receiver goes away.
async fn forward<K, D, S>(
    kind: &str,
    stream: S,
    tx: &mpsc::Sender<Notification<D>>,
    describe: impl Fn(&K) -> Option<D>,
    key: impl Fn(&K) -> String,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event<K>, watcher::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut initial: Option<Vec<D>> = None;

    while let Some(event) = stream.next().await {
        let notification = match event {
            Ok(Event::Init) => {
                debug!("{} list started", kind);
                initial = Some(Vec::new());
                continue;
            }
            Ok(Event::InitApply(obj)) => {
                if let (Some(listed), Some(member)) = (initial.as_mut(), describe(&obj)) {
                    listed.push(member);
                }
                continue;
            }
            Ok(Event::InitDone) => Notification::Resync(initial.take().unwrap_or_default()),
            Ok(Event::Apply(obj)) => match describe(&obj) {
                Some(member) => Notification::Apply(member),
                None => Notification::Delete(key(&obj)),
            },
            Ok(Event::Delete(obj)) => Notification::Delete(key(&obj)),
            Err(e) => {
                warn!("{} watch error: {}", kind, e);
                continue;
            }
        };

        if tx.send(notification).await.is_err() {
            debug!("{} notification channel closed, stopping watcher", kind);
            return Ok(());
        }
    }

    Err(Error::Watch(format!("{} watch stream ended", kind)))
}

fn parse_annotation<T>(annotations: &BTreeMap<String, String>, key: &str, object: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = annotations.get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring malformed {} on {}: {}", key, object, e);
            None
        }
    }
}

pub fn node_descriptor(node: &Node, local: &str) -> RemoteNodeDescriptor {
    let name = node.name_any();
    let annotations = node.annotations();
    let node_ip = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| addresses.iter().find(|a| a.type_ == "InternalIP"))
        .and_then(|a| a.address.parse::<Ipv4Addr>().ok());

    RemoteNodeDescriptor {
        is_local: name == local,
        overlay_subnet: parse_annotation(annotations, NODE_SUBNET_ANNOTATION, &name),
        overlay_mac: parse_annotation(annotations, NODE_DR_MAC_ANNOTATION, &name),
        node_ip,
        name,
    }
}

fn pod_key(pod: &Pod) -> String {
    LocalPodDescriptor::key_for(&pod.namespace().unwrap_or_default(), &pod.name_any())
}

/// Describes a pod that may need a flow, or `None` when the pod is not (or no
/// longer) a local, running, pod-network workload.
pub fn pod_descriptor(pod: &Pod, local: &str) -> Option<LocalPodDescriptor> {
    let spec = pod.spec.as_ref()?;
    if spec.node_name.as_deref() != Some(local) || spec.host_network.unwrap_or(false) {
        return None;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Succeeded") | Some("Failed")) {
        return None;
    }

    let qualified_name = pod_key(pod);
    let (ip, mac) = pod
        .annotations()
        .get(POD_NETWORKS_ANNOTATION)
        .map(|raw| parse_pod_networks(raw, &qualified_name))
        .unwrap_or((None, None));

    Some(LocalPodDescriptor { qualified_name, ip, mac })
}

#[derive(Debug, Deserialize)]
struct PodNetwork {
    ip_address: Option<String>,
    mac_address: Option<String>,
}

/// Reads the default network's address and MAC. The address may carry a
/// prefix length, which is dropped.
fn parse_pod_networks(raw: &str, pod: &str) -> (Option<Ipv4Addr>, Option<MacAddr>) {
    let networks: HashMap<String, PodNetwork> = match serde_json::from_str(raw) {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Ignoring malformed {} on {}: {}", POD_NETWORKS_ANNOTATION, pod, e);
            return (None, None);
        }
    };
    let Some(network) = networks.get(DEFAULT_NETWORK) else {
        return (None, None);
    };

    let ip = network
        .ip_address
        .as_deref()
        .and_then(|addr| addr.split('/').next())
        .and_then(|addr| addr.trim().parse().ok());
    let mac = network.mac_address.as_deref().and_then(|m| m.trim().parse().ok());
    (ip, mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn create_node(name: &str, ip: &str, annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        address: "node1.example".into(),
                        type_: "Hostname".into(),
                    },
                    NodeAddress {
                        address: ip.into(),
                        type_: "InternalIP".into(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn create_pod(name: &str, node: &str, phase: &str, networks: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some(name.into()),
                annotations: networks.map(|n| BTreeMap::from([(POD_NETWORKS_ANNOTATION.to_string(), n.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
        }
    }

    const POD1_NETWORKS: &str =
        r#"{"default": {"ip_address":"1.2.3.5/24", "mac_address":"aa:bb:cc:dd:ee:ff", "gateway_ip": "1.2.3.6"}}"#;

    #[test]
    fn annotated_node_is_described() {
        let node = create_node(
            "node1",
            "10.0.0.2",
            &[
                (NODE_SUBNET_ANNOTATION, "5.6.7.0/24"),
                (NODE_DR_MAC_ANNOTATION, "22:33:44:55:66:77"),
            ],
        );
        let descriptor = node_descriptor(&node, "mynode");
        assert_eq!(
            descriptor,
            RemoteNodeDescriptor {
                name: "node1".into(),
                is_local: false,
                overlay_subnet: Some("5.6.7.0/24".parse().unwrap()),
                overlay_mac: Some("22:33:44:55:66:77".parse().unwrap()),
                node_ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
            }
        );
        assert!(descriptor.hybrid_overlay().is_some());
    }

    #[test]
    fn malformed_node_annotations_degrade_to_invalid() {
        let node = create_node(
            "node1",
            "10.0.0.2",
            &[
                (NODE_SUBNET_ANNOTATION, "5.6.7.0/33"),
                (NODE_DR_MAC_ANNOTATION, "22:33:44:55:66:77"),
            ],
        );
        let descriptor = node_descriptor(&node, "mynode");
        assert_eq!(descriptor.overlay_subnet, None);
        assert!(descriptor.hybrid_overlay().is_none());

        assert!(node_descriptor(&create_node("mynode", "10.0.0.1", &[]), "mynode").is_local);
    }

    #[test]
    fn local_running_pod_is_described() {
        let descriptor = pod_descriptor(&create_pod("pod1", "mynode", "Running", Some(POD1_NETWORKS)), "mynode")
            .expect("pod is local");
        assert_eq!(descriptor.qualified_name, "default_pod1");
        assert_eq!(descriptor.ip, Some(Ipv4Addr::new(1, 2, 3, 5)));
        assert_eq!(descriptor.mac, Some("aa:bb:cc:dd:ee:ff".parse().unwrap()));
    }

    #[test]
    fn pods_that_need_no_flow_are_excluded() {
        assert!(pod_descriptor(&create_pod("pod1", "othernode", "Running", Some(POD1_NETWORKS)), "mynode").is_none());
        assert!(pod_descriptor(&create_pod("pod1", "mynode", "Succeeded", Some(POD1_NETWORKS)), "mynode").is_none());

        let mut host = create_pod("pod1", "mynode", "Running", Some(POD1_NETWORKS));
        host.spec.as_mut().unwrap().host_network = Some(true);
        assert!(pod_descriptor(&host, "mynode").is_none());

        let bare = pod_descriptor(&create_pod("pod1", "mynode", "Pending", None), "mynode").unwrap();
        assert_eq!(bare.addresses(), None);
        let garbled = pod_descriptor(&create_pod("pod1", "mynode", "Running", Some("{not json")), "mynode").unwrap();
        assert_eq!(garbled.addresses(), None);
    }

    #[tokio::test]
    async fn initial_list_becomes_one_resync() {
        let events = vec![
            Event::Init,
            Event::InitApply(create_pod("pod1", "mynode", "Running", Some(POD1_NETWORKS))),
            Event::InitApply(create_pod("done", "mynode", "Succeeded", None)),
            Event::InitDone,
            Event::Apply(create_pod("pod1", "mynode", "Failed", Some(POD1_NETWORKS))),
            Event::Delete(create_pod("pod2", "mynode", "Running", None)),
        ];
        let stream = futures_util::stream::iter(events.into_iter().map(Ok::<_, watcher::Error>));
        let (tx, mut rx) = mpsc::channel(8);

        let result = forward("pod", stream, &tx, |p: &Pod| pod_descriptor(p, "mynode"), pod_key).await;
        assert!(matches!(result, Err(Error::Watch(_))));

        match rx.recv().await.unwrap() {
            Notification::Resync(pods) => {
                assert_eq!(pods.len(), 1);
                assert_eq!(pods[0].qualified_name, "default_pod1");
            }
            other => panic!("expected resync, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), Notification::Delete("default_pod1".into()));
        assert_eq!(rx.recv().await.unwrap(), Notification::Delete("default_pod2".into()));
    }
}
