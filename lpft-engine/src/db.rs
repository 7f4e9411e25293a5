//! South-bound data source and downstream flow sink contracts (§6).

use std::collections::HashSet;

use compact_str::CompactString;
use lpft_core::{AsTag, DatapathId, DesiredFlow, DpGroupId, FlowId, IpNet, LocalDatapath, LogicalFlow, PortBinding};
use lpft_lb::LoadBalancer;
use lpft_portsec::PortSecEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    Inserted,
    Updated,
    Deleted,
}

/// Rows present in the south-bound view purely for interface completeness
/// (§6 "required tables") — the compiler/engine has no dedicated
/// generator for these, so they carry only the fields needed to identify
/// and scan them, not full OVN semantics.
#[derive(Debug, Clone)]
pub struct McastGroup {
    pub name: CompactString,
    pub datapath: DatapathId,
}

#[derive(Debug, Clone)]
pub struct MacBindingRow {
    pub datapath: DatapathId,
    pub ip: std::net::IpAddr,
    pub mac: [u8; 6],
}

#[derive(Debug, Clone)]
pub struct FdbRow {
    pub dp_key: u64,
    pub mac: [u8; 6],
    pub port_tag: u32,
}

/// South-bound data source (§6): a row-oriented view over the tables the
/// engine reads, with full-scan iterators for every table and tracked
/// insert/update/delete iterators for the subset the incremental
/// protocols of §4.7 consume. The core never mutates this; it's owned and
/// advanced (for tracking) by whatever wires the engine to the real
/// database.
pub trait SbDatabase {
    fn logical_flows(&self) -> Box<dyn Iterator<Item = &LogicalFlow> + '_>;
    fn logical_flow(&self, id: FlowId) -> Option<&LogicalFlow>;
    fn tracked_logical_flows(&self) -> Box<dyn Iterator<Item = (FlowId, RowChange)> + '_>;

    fn local_datapaths(&self) -> Box<dyn Iterator<Item = &LocalDatapath> + '_>;
    fn local_datapath(&self, id: DatapathId) -> Option<&LocalDatapath>;
    fn tracked_local_datapaths(&self) -> Box<dyn Iterator<Item = (DatapathId, RowChange)> + '_>;

    fn port_bindings(&self) -> Box<dyn Iterator<Item = &PortBinding> + '_>;
    fn port_binding_by_name(&self, name: &str) -> Option<&PortBinding>;
    fn tracked_port_bindings(&self) -> Box<dyn Iterator<Item = (CompactString, RowChange)> + '_>;

    fn load_balancers(&self) -> Box<dyn Iterator<Item = &LoadBalancer> + '_>;
    fn tracked_load_balancers(&self) -> Box<dyn Iterator<Item = (FlowId, RowChange)> + '_>;

    fn address_set(&self, name: &str) -> Option<&[IpNet]>;
    fn port_group(&self, name: &str) -> Option<&[u32]>;

    /// Member datapaths of a `LogicalDatapathGroup` row, for flows bound
    /// via `DatapathRef::Group` (§3).
    fn dp_group_members(&self, group: DpGroupId) -> &[DatapathId];

    /// Port-security entries attached to a `PortBinding` (§4.9), keyed by
    /// port name.
    fn port_security(&self, port_name: &str) -> &[PortSecEntry];

    fn mcast_groups(&self) -> Box<dyn Iterator<Item = &McastGroup> + '_>;
    fn mac_bindings(&self) -> Box<dyn Iterator<Item = &MacBindingRow> + '_>;
    fn static_mac_bindings(&self) -> Box<dyn Iterator<Item = &MacBindingRow> + '_>;
    fn fdb_rows(&self) -> Box<dyn Iterator<Item = &FdbRow> + '_>;
}

/// Downstream flow sink (§6): cookie-addressed by the low 32 bits of the
/// owning uuid, diffed against whatever's actually installed by whatever
/// wires this to the switch.
pub trait FlowSink {
    fn add_flow(&mut self, flow: DesiredFlow);
    fn add_flow_metered(&mut self, flow: DesiredFlow, meter: u32);
    /// Merges `flow`'s actions into any existing flow at the same
    /// `(table, priority, match)` key instead of overwriting it (§4.5) —
    /// the mechanism that lets two logical flows, or an ordinary flow and
    /// an LB hairpin rule, share a conjunction clause flow.
    fn add_or_append_flow(&mut self, flow: DesiredFlow);
    fn remove_flows(&mut self, owner: FlowId);
    /// Removes desired flows owned by `owner` whose `as_tag` matches
    /// `as_info` exactly. Returns `false` if the number removed doesn't
    /// equal `ref_count`, signalling the caller should fall back to a full
    /// recompile of `owner` instead of trusting the delta.
    fn remove_flows_for_as_ip(&mut self, owner: FlowId, as_info: &AsTag, ref_count: u32) -> bool;
    /// Removes every desired flow owned by any id in `ids`. Returns the
    /// subset of `ids` that actually had output removed.
    fn flood_remove_flows(&mut self, ids: &HashSet<FlowId>) -> HashSet<FlowId>;
}
