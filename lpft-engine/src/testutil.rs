//! In-memory `SbDatabase`/`FlowSink` test doubles (§10.4).

use std::collections::HashSet;

use compact_str::CompactString;
use fxhash::FxHashMap;
use lpft_core::{
    AsTag, DatapathId, DesiredFlow, DpGroupId, FlowId, IpNet, LocalDatapath, LogicalFlow, OfMatch,
    PortBinding,
};
use lpft_lb::LoadBalancer;
use lpft_portsec::PortSecEntry;

use crate::db::{FdbRow, FlowSink, MacBindingRow, McastGroup, RowChange, SbDatabase};

#[derive(Default)]
pub struct InMemorySbDb {
    pub logical_flows: FxHashMap<FlowId, LogicalFlow>,
    pub tracked_lf: Vec<(FlowId, RowChange)>,
    pub local_datapaths: FxHashMap<DatapathId, LocalDatapath>,
    pub tracked_dp: Vec<(DatapathId, RowChange)>,
    pub port_bindings: FxHashMap<CompactString, PortBinding>,
    pub tracked_pb: Vec<(CompactString, RowChange)>,
    pub load_balancers: FxHashMap<FlowId, LoadBalancer>,
    pub tracked_lb: Vec<(FlowId, RowChange)>,
    pub address_sets: FxHashMap<CompactString, Vec<IpNet>>,
    pub port_groups: FxHashMap<CompactString, Vec<u32>>,
    pub dp_groups: FxHashMap<DpGroupId, Vec<DatapathId>>,
    pub port_security: FxHashMap<CompactString, Vec<PortSecEntry>>,
    pub mcast_groups: Vec<McastGroup>,
    pub mac_bindings: Vec<MacBindingRow>,
    pub static_mac_bindings: Vec<MacBindingRow>,
    pub fdb_rows: Vec<FdbRow>,
}

impl InMemorySbDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_lf(&mut self, lf: LogicalFlow) {
        self.logical_flows.insert(lf.id, lf);
    }

    pub fn insert_dp(&mut self, dp: LocalDatapath) {
        self.local_datapaths.insert(dp.id, dp);
    }

    pub fn insert_pb(&mut self, pb: PortBinding) {
        self.port_bindings.insert(pb.name.clone(), pb);
    }

    pub fn by_name(&self) -> &FxHashMap<CompactString, PortBinding> {
        &self.port_bindings
    }
}

impl SbDatabase for InMemorySbDb {
    fn logical_flows(&self) -> Box<dyn Iterator<Item = &LogicalFlow> + '_> {
        Box::new(self.logical_flows.values())
    }

    fn logical_flow(&self, id: FlowId) -> Option<&LogicalFlow> {
        self.logical_flows.get(&id)
    }

    fn tracked_logical_flows(&self) -> Box<dyn Iterator<Item = (FlowId, RowChange)> + '_> {
        Box::new(self.tracked_lf.iter().copied())
    }

    fn local_datapaths(&self) -> Box<dyn Iterator<Item = &LocalDatapath> + '_> {
        Box::new(self.local_datapaths.values())
    }

    fn local_datapath(&self, id: DatapathId) -> Option<&LocalDatapath> {
        self.local_datapaths.get(&id)
    }

    fn tracked_local_datapaths(&self) -> Box<dyn Iterator<Item = (DatapathId, RowChange)> + '_> {
        Box::new(self.tracked_dp.iter().copied())
    }

    fn port_bindings(&self) -> Box<dyn Iterator<Item = &PortBinding> + '_> {
        Box::new(self.port_bindings.values())
    }

    fn port_binding_by_name(&self, name: &str) -> Option<&PortBinding> {
        self.port_bindings.get(name)
    }

    fn tracked_port_bindings(&self) -> Box<dyn Iterator<Item = (CompactString, RowChange)> + '_> {
        Box::new(self.tracked_pb.iter().cloned())
    }

    fn load_balancers(&self) -> Box<dyn Iterator<Item = &LoadBalancer> + '_> {
        Box::new(self.load_balancers.values())
    }

    fn tracked_load_balancers(&self) -> Box<dyn Iterator<Item = (FlowId, RowChange)> + '_> {
        Box::new(self.tracked_lb.iter().copied())
    }

    fn address_set(&self, name: &str) -> Option<&[IpNet]> {
        self.address_sets.get(name).map(|v| v.as_slice())
    }

    fn port_group(&self, name: &str) -> Option<&[u32]> {
        self.port_groups.get(name).map(|v| v.as_slice())
    }

    fn dp_group_members(&self, group: DpGroupId) -> &[DatapathId] {
        self.dp_groups.get(&group).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn port_security(&self, port_name: &str) -> &[PortSecEntry] {
        self.port_security.get(port_name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn mcast_groups(&self) -> Box<dyn Iterator<Item = &McastGroup> + '_> {
        Box::new(self.mcast_groups.iter())
    }

    fn mac_bindings(&self) -> Box<dyn Iterator<Item = &MacBindingRow> + '_> {
        Box::new(self.mac_bindings.iter())
    }

    fn static_mac_bindings(&self) -> Box<dyn Iterator<Item = &MacBindingRow> + '_> {
        Box::new(self.static_mac_bindings.iter())
    }

    fn fdb_rows(&self) -> Box<dyn Iterator<Item = &FdbRow> + '_> {
        Box::new(self.fdb_rows.iter())
    }
}

/// Records desired flows content-addressed by `(table, priority, match)`,
/// exactly the way the real sink is specified to collapse duplicates.
#[derive(Default)]
pub struct RecordingSink {
    pub table: FxHashMap<(u8, u16, OfMatch), DesiredFlow>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flows(&self) -> impl Iterator<Item = &DesiredFlow> {
        self.table.values()
    }

    pub fn owned_by(&self, owner: FlowId) -> Vec<&DesiredFlow> {
        self.table.values().filter(|f| f.owner == owner).collect()
    }
}

impl FlowSink for RecordingSink {
    fn add_flow(&mut self, flow: DesiredFlow) {
        self.table.insert(flow.key(), flow);
    }

    fn add_flow_metered(&mut self, flow: DesiredFlow, _meter: u32) {
        self.table.insert(flow.key(), flow);
    }

    fn add_or_append_flow(&mut self, flow: DesiredFlow) {
        let key = flow.key();
        match self.table.get_mut(&key) {
            Some(existing) => {
                for action in flow.actions {
                    if !existing.actions.contains(&action) {
                        existing.actions.push(action);
                    }
                }
            }
            None => {
                self.table.insert(key, flow);
            }
        }
    }

    fn remove_flows(&mut self, owner: FlowId) {
        self.table.retain(|_, f| f.owner != owner);
    }

    fn remove_flows_for_as_ip(&mut self, owner: FlowId, as_info: &AsTag, ref_count: u32) -> bool {
        let before = self.table.len();
        self.table.retain(|_, f| !(f.owner == owner && f.as_tag.as_ref() == Some(as_info)));
        let removed = before - self.table.len();
        removed as u32 == ref_count
    }

    fn flood_remove_flows(&mut self, ids: &HashSet<FlowId>) -> HashSet<FlowId> {
        let mut removed_owners = HashSet::new();
        self.table.retain(|_, f| {
            if ids.contains(&f.owner) {
                removed_owners.insert(f.owner);
                false
            } else {
                true
            }
        });
        removed_owners
    }
}
