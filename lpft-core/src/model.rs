use compact_str::CompactString;
use fxhash::FxHashMap;

use crate::action::OfAction;
use crate::ids::{ConjId, DatapathId, DatapathRef, FlowId, PortId, TunnelKey};
use crate::ofmatch::{AsTag, OfMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

/// `LogicalFlow`, §3.
#[derive(Debug, Clone)]
pub struct LogicalFlow {
    pub id: FlowId,
    pub direction: Direction,
    pub logical_table: u8,
    pub priority: u16,
    pub r#match: CompactString,
    pub actions: CompactString,
    pub datapath: DatapathRef,
    pub in_out_port: Option<CompactString>,
    pub controller_meter: Option<CompactString>,
    pub match_local_only: bool,
}

impl LogicalFlow {
    /// Enforces the `datapath XOR datapath_group` invariant at the one
    /// place rows enter the system, rather than re-checking it at every
    /// call site.
    pub fn new(
        id: FlowId,
        direction: Direction,
        logical_table: u8,
        priority: u16,
        r#match: impl Into<CompactString>,
        actions: impl Into<CompactString>,
        datapath: DatapathRef,
    ) -> Self {
        Self {
            id,
            direction,
            logical_table,
            priority,
            r#match: r#match.into(),
            actions: actions.into(),
            datapath,
            in_out_port: None,
            controller_meter: None,
            match_local_only: false,
        }
    }
}

/// `LocalDatapath`, §3.
#[derive(Debug, Clone)]
pub struct LocalDatapath {
    pub id: DatapathId,
    pub tunnel_key: TunnelKey,
    pub is_switch: bool,
    pub external_ids: FxHashMap<CompactString, CompactString>,
}

impl LocalDatapath {
    pub fn is_router(&self) -> bool {
        !self.is_switch
    }

    /// Derives `common_nat_ct_zone` per §4.4: `snat-ct-zone` if configured,
    /// otherwise the DNAT zone.
    pub fn common_nat_ct_zone(&self) -> crate::action::CtZone {
        if self.external_ids.contains_key("snat-ct-zone") {
            crate::action::CtZone::Snat
        } else {
            crate::action::CtZone::Dnat
        }
    }
}

/// `ResourceRef` type tag, §3/§4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefType {
    AddressSet,
    PortGroup,
    PortBinding,
    McastGroup,
}

/// A local logical port this chassis hosts, keyed by `(datapath, port tag)`
/// per §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalLport {
    pub datapath: DatapathId,
    pub port_tag: u32,
}

/// Port kinds relevant to `is_chassis_resident` (§4.3 step 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortKind {
    Plain { chassis: Option<CompactString> },
    ChassisRedirect { ha_group: CompactString },
}

#[derive(Debug, Clone)]
pub struct PortBinding {
    pub id: PortId,
    pub name: CompactString,
    pub datapath: DatapathId,
    pub tag: u32,
    pub kind: PortKind,
}

/// `DesiredFlow`, §3. Identity for content-addressing is
/// `(table_id, priority, match)`; `cookie`/`owner` are carried data, not
/// part of the identity, matching "the flow sink is content-addressed:
/// duplicates collapse".
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredFlow {
    pub table_id: u8,
    pub priority: u16,
    pub r#match: OfMatch,
    pub actions: Vec<OfAction>,
    pub cookie: u32,
    pub owner: FlowId,
    pub as_tag: Option<AsTag>,
}

impl DesiredFlow {
    pub fn key(&self) -> (u8, u16, OfMatch) {
        (self.table_id, self.priority, self.r#match.clone())
    }
}

/// Outcome of compiling one `LogicalFlow` against one `LocalDatapath`
/// (§7, §10.3): failures that are an expected, steady-state part of
/// operating against an eventually-consistent database are data, not
/// `Err`. Only truly exceptional conditions (conjunction id exhaustion)
/// propagate as `anyhow::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ParseError,
    AnnotationError,
    NotChassisResident,
    NonLocalInOutPort,
}

#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(Vec<DesiredFlow>),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConjRange {
    pub first: ConjId,
    pub n: u32,
}

impl ConjRange {
    pub fn contains(&self, id: ConjId) -> bool {
        id.0 >= self.first.0 && id.0 < self.first.0 + self.n
    }
}
