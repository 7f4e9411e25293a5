use std::fmt;

use uuid::Uuid;

/// Unique id of a `LogicalFlow` row, per §3. The low 32 bits double as the
/// OpenFlow cookie used by the flow sink to cookie-address desired flows.
pub type FlowId = Uuid;

/// Unique id of a `LocalDatapath` / `Datapath` row.
pub type DatapathId = Uuid;

/// Unique id of a `LogicalDatapathGroup` row.
pub type DpGroupId = Uuid;

/// Unique id of a `PortBinding` row.
pub type PortId = Uuid;

pub fn cookie_of(flow: FlowId) -> u32 {
    let bytes = flow.as_bytes();
    u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]])
}

/// The compact integer tunnel key carried by a `LocalDatapath` (the
/// `metadata` OpenFlow match value, per §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunnelKey(pub u64);

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A 32-bit OpenFlow conjunction id, §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConjId(pub u32);

/// Either end of a `LogicalFlow`'s `datapath XOR datapath_group` invariant
/// (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatapathRef {
    Single(DatapathId),
    Group(DpGroupId),
}
