//! Canonical, content-addressable OpenFlow match representation (§3
//! `DesiredFlow`, §6 field ids). A `BTreeMap` keeps iteration order
//! deterministic so two equivalently-built matches compare and hash equal,
//! which is what lets the flow sink collapse duplicates and the engine
//! check P1 idempotence.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Fields from the `MFF_*` catalogue in §6, plus the generic register
/// fallback used by matches this translator doesn't give a dedicated name
/// (e.g. an arbitrary `MFF_REGn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchField {
    Metadata,
    EthType,
    EthSrc,
    EthDst,
    Ip4Src,
    Ip4Dst,
    Ip6Src,
    Ip6Dst,
    IpProto,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    SctpSrc,
    SctpDst,
    LogInport,
    LogOutport,
    LogFlags,
    CtMarkNatted,
    CtLabelNatted,
    CtOrigDip4,
    CtOrigDip6,
    CtOrigTpDst,
    ConjId,
    ArpOp,
    ArpSpa,
    ArpTpa,
    ArpSha,
    ArpTha,
    Icmp6Type,
    NdTarget,
    NdSll,
    NdTll,
    NwTtl,
    VlanTci,
    /// `MFF_REG0..MFF_REG9` / `MFF_XXREG0`, addressed by register number.
    Reg(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U32Masked(u32, u32),
    U64(u64),
    U128(u128),
    Mac([u8; 6]),
    MacMasked([u8; 6], [u8; 6]),
    Ipv4(Ipv4Addr),
    Ipv4Masked(Ipv4Addr, Ipv4Addr),
    Ipv6(Ipv6Addr),
    Ipv6Masked(Ipv6Addr, Ipv6Addr),
}

/// A single OpenFlow match, built up field by field during expression
/// normalization (§4.3 step 7) or directly by the LB/port-security
/// generators (§4.8, §4.9).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OfMatch(pub BTreeMap<MatchField, MatchValue>);

impl OfMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: MatchField, value: MatchValue) -> &mut Self {
        self.0.insert(field, value);
        self
    }

    pub fn with(mut self, field: MatchField, value: MatchValue) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: &MatchField) -> Option<&MatchValue> {
        self.0.get(field)
    }

    /// Value of a logical in/outport register, used by §4.5's local-port
    /// filter. Inport and outport are both modeled as `Reg` fields with
    /// fixed register numbers chosen by the action/expr encoders
    /// (`MFF_LOG_INPORT`/`MFF_LOG_OUTPORT`).
    pub fn log_port(&self, field: MatchField) -> Option<u32> {
        match self.0.get(&field) {
            Some(MatchValue::U32(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Per-address-set tag carried on a match that originated from an
/// `==`-against-address-set comparison (§4.3 step 7, §4.7 AS delta).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsTag {
    pub name: compact_str::CompactString,
    pub ip: IpNet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpNet {
    V4(Ipv4Addr, u8),
    V6(Ipv6Addr, u8),
}

impl IpNet {
    pub fn host_v4(a: Ipv4Addr) -> Self {
        IpNet::V4(a, 32)
    }

    pub fn host_v6(a: Ipv6Addr) -> Self {
        IpNet::V6(a, 128)
    }
}
