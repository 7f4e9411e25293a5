//! Physical table numbers and reserved metadata bits (§6). The numeric
//! values are fixed by the table map handed to the action encoder at
//! construction time (§9 "process-wide state... explicit construction
//! parameter"), not hardcoded as magic numbers scattered through the
//! compiler.

use fxhash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysTable {
    LogIngressPipeline,
    LogEgressPipeline,
    RemoteOutput,
    SaveInport,
    MacBinding,
    MacLookup,
    ChkLbHairpin,
    ChkLbHairpinReply,
    CtSnatHairpin,
    GetFdb,
    LookupFdb,
    ChkInPortSec,
    ChkInPortSecNd,
    ChkOutPortSec,
}

/// Maps the abstract table names above to the OpenFlow table numbers in
/// use on this chassis. Built once at engine construction (§6) and handed
/// by reference to every component that emits flows.
#[derive(Debug, Clone)]
pub struct TableMap(FxHashMap<PhysTable, u8>);

impl TableMap {
    pub fn new(entries: impl IntoIterator<Item = (PhysTable, u8)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn get(&self, t: PhysTable) -> u8 {
        *self.0.get(&t).unwrap_or_else(|| {
            panic!("table map missing required physical table {:?}", t)
        })
    }

    /// `LOG_INGRESS_PIPELINE + logical_table` / `LOG_EGRESS_PIPELINE + logical_table`
    /// per §8 scenario 1.
    pub fn pipeline_table(&self, ingress: bool, logical_table: u8) -> u8 {
        let base = if ingress {
            self.get(PhysTable::LogIngressPipeline)
        } else {
            self.get(PhysTable::LogEgressPipeline)
        };
        base + logical_table
    }
}

impl Default for TableMap {
    /// A plausible default numbering, used by tests and as a starting
    /// point for the binary's configuration (§10.2); real deployments
    /// override individual entries to match chassis bring-up.
    fn default() -> Self {
        use PhysTable::*;
        Self::new([
            (LogIngressPipeline, 8),
            (LogEgressPipeline, 32),
            (RemoteOutput, 64),
            (SaveInport, 65),
            (MacBinding, 66),
            (MacLookup, 67),
            (ChkLbHairpin, 68),
            (ChkLbHairpinReply, 69),
            (CtSnatHairpin, 70),
            (GetFdb, 71),
            (LookupFdb, 72),
            (ChkInPortSec, 73),
            (ChkInPortSecNd, 74),
            (ChkOutPortSec, 75),
        ])
    }
}

/// Reserved bits of `MFF_LOG_FLAGS` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogFlagBit {
    LookupMac = 1 << 0,
    LookupFdb = 1 << 1,
    LookupLbHairpin = 1 << 2,
    CheckPortSec = 1 << 3,
}
