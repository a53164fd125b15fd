//! Hybrid overlay node agent.
//!
//! Programs the external Open vSwitch bridge of a node so that traffic between
//! the SDN overlay and hosts that only speak plain VXLAN is encapsulated,
//! decapsulated and re-addressed correctly.
//!
//! The agent keeps no record of what it installed. Every rule is tagged with a
//! cookie derived from the node or pod it serves ([`cookie`]), and each
//! convergence pass diffs a fresh table dump against rules recomputed from the
//! current cluster state ([`converge`]).
//!
//! ```text
//! [node watch] -> [node worker] -> NodeFlowReconciler --\
//!                                                        +--> Device (one lock) --> ovs-ofctl / ovs-vsctl
//! [pod watch]  -> [pod worker]  -> PodFlowReconciler  --/
//! ```

pub mod bootstrap;
pub mod config;
pub mod converge;
pub mod cookie;
pub mod device;
pub mod error;
pub mod flow;
pub mod node;
pub mod pod;
pub mod types;
pub mod watch;
pub mod worker;
