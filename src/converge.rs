//! Table convergence.
//!
//! A pass dumps one table, groups the tagged rules by cookie and compares
//! them with the desired rules for that table. Cookies that are no longer
//! wanted are deleted, missing or changed ones are (re)added, and everything
//! already in place is left alone. Base rules carry cookie zero and are never
//! touched. Nothing is remembered between passes: the dump is the only record
//! of what is installed.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::cookie::FlowCookie;
use crate::device::Device;
use crate::error::Result;
use crate::flow::{Flow, FlowSignature, InstalledFlow};

/// Rules one reconciler wants in one table, grouped by cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRuleSet {
    table: u8,
    groups: BTreeMap<FlowCookie, Vec<Flow>>,
}

impl DesiredRuleSet {
    pub fn new(table: u8) -> Self {
        Self {
            table,
            groups: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> u8 {
        self.table
    }

    /// Adds a rule under `cookie`, retargeting it at this set's table.
    pub fn insert(&mut self, cookie: FlowCookie, mut flow: Flow) {
        flow.table = self.table;
        self.groups.entry(cookie).or_default().push(flow.with_cookie(cookie));
    }

    pub fn get(&self, cookie: FlowCookie) -> Option<&[Flow]> {
        self.groups.get(&cookie).map(Vec::as_slice)
    }

    pub fn cookies(&self) -> impl Iterator<Item = FlowCookie> + '_ {
        self.groups.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Tagged rules found in a table dump, grouped by cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledRuleSnapshot {
    groups: BTreeMap<FlowCookie, BTreeSet<FlowSignature>>,
}

impl InstalledRuleSnapshot {
    /// Builds a snapshot from `ovs-ofctl dump-flows` output. Lines that do not
    /// parse are skipped so one odd line never blocks the rest of the table.
    pub fn parse(table: u8, dump: &str) -> Self {
        let mut groups: BTreeMap<FlowCookie, BTreeSet<FlowSignature>> = BTreeMap::new();
        for line in dump.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("NXST_FLOW") || trimmed.starts_with("OFPST_FLOW") {
                continue;
            }
            let Some(flow) = InstalledFlow::parse(trimmed) else {
                warn!("Skipping unparseable flow in table {}: {}", table, trimmed);
                continue;
            };
            if flow.cookie.is_base() || flow.table.is_some_and(|t| t != table) {
                continue;
            }
            groups.entry(flow.cookie).or_default().insert(flow.signature);
        }
        Self { groups }
    }

    pub fn contains(&self, cookie: FlowCookie) -> bool {
        self.groups.contains_key(&cookie)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Device commands needed to move a table from installed to desired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergePlan {
    /// Cookies to delete, either gone entirely or carrying rules whose match is
    /// no longer wanted.
    pub delete: Vec<FlowCookie>,
    /// Rules to add or replace.
    pub add: Vec<Flow>,
}

impl ConvergePlan {
    pub fn compute(desired: &DesiredRuleSet, installed: &InstalledRuleSnapshot) -> Self {
        let mut plan = ConvergePlan::default();

        for (cookie, present) in &installed.groups {
            match desired.groups.get(cookie) {
                None => plan.delete.push(*cookie),
                Some(flows) => {
                    let wanted: Vec<_> = flows.iter().map(Flow::signature).collect();
                    let lingering = present
                        .iter()
                        .any(|p| !wanted.iter().any(|w| w.same_match(p)));
                    if lingering {
                        // a re-add would not replace these, they have to go first
                        plan.delete.push(*cookie);
                    }
                }
            }
        }

        for (cookie, flows) in &desired.groups {
            let up_to_date = !plan.delete.contains(cookie)
                && installed
                    .groups
                    .get(cookie)
                    .is_some_and(|present| flows.iter().all(|f| present.contains(&f.signature())));
            if !up_to_date {
                plan.add.extend(flows.iter().cloned());
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.add.is_empty()
    }
}

/// What a pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    pub deleted: usize,
    pub added: usize,
}

/// Converges `desired.table()` on `bridge`.
///
/// The executor stays locked for the whole pass. A failing command aborts the
/// pass; the next notification recomputes everything and tries again.
pub async fn reconcile(device: &Device, bridge: &str, desired: &DesiredRuleSet) -> Result<ConvergeReport> {
    let table = desired.table();
    let session = device.session().await;

    let dump = session.dump_flows(bridge, table).await?;
    let installed = InstalledRuleSnapshot::parse(table, &dump);
    let plan = ConvergePlan::compute(desired, &installed);
    debug!(
        "Table {}: {} desired cookies, {} installed, {} to delete, {} rules to add",
        table,
        desired.len(),
        installed.len(),
        plan.delete.len(),
        plan.add.len()
    );

    for cookie in &plan.delete {
        session.del_flows(bridge, table, *cookie).await?;
    }
    for flow in &plan.add {
        session.add_flow(bridge, flow).await?;
    }

    Ok(ConvergeReport {
        deleted: plan.delete.len(),
        added: plan.add.len(),
    })
}
