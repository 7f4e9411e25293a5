//! Fixed field symbol table (§4.3 step 1/3): the predefined match-field
//! names the parser/annotator accepts, each tagged with the `MatchField`
//! it compiles to and the `Value` shape a comparison against it must have.

use fxhash::FxHashMap;
use lpft_core::MatchField;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Ipv4,
    Ipv6,
    Mac,
    Int,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub match_field: MatchField,
}

/// `AnnotationError` (§7): `field` referenced a name not in the symbol
/// table, or compared it against a `Value` of the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationError(pub String);

impl std::fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AnnotationError {}

pub struct Symtab(FxHashMap<&'static str, FieldSpec>);

impl Symtab {
    pub fn get(&self, name: &str) -> Option<FieldSpec> {
        self.0.get(name).copied()
    }
}

impl Default for Symtab {
    fn default() -> Self {
        use FieldKind::*;
        use MatchField::*;
        let entries: &[(&str, FieldSpec)] = &[
            ("eth.type", FieldSpec { kind: Int, match_field: EthType }),
            ("ip4.src", FieldSpec { kind: Ipv4, match_field: Ip4Src }),
            ("ip4.dst", FieldSpec { kind: Ipv4, match_field: Ip4Dst }),
            ("ip6.src", FieldSpec { kind: Ipv6, match_field: Ip6Src }),
            ("ip6.dst", FieldSpec { kind: Ipv6, match_field: Ip6Dst }),
            ("eth.src", FieldSpec { kind: Mac, match_field: EthSrc }),
            ("eth.dst", FieldSpec { kind: Mac, match_field: EthDst }),
            ("tcp.src", FieldSpec { kind: Int, match_field: TcpSrc }),
            ("tcp.dst", FieldSpec { kind: Int, match_field: TcpDst }),
            ("udp.src", FieldSpec { kind: Int, match_field: UdpSrc }),
            ("udp.dst", FieldSpec { kind: Int, match_field: UdpDst }),
            ("sctp.src", FieldSpec { kind: Int, match_field: SctpSrc }),
            ("sctp.dst", FieldSpec { kind: Int, match_field: SctpDst }),
            ("ip.proto", FieldSpec { kind: Int, match_field: IpProto }),
            ("inport", FieldSpec { kind: Int, match_field: LogInport }),
            ("outport", FieldSpec { kind: Int, match_field: LogOutport }),
            ("arp.spa", FieldSpec { kind: Ipv4, match_field: ArpSpa }),
            ("arp.tpa", FieldSpec { kind: Ipv4, match_field: ArpTpa }),
            ("arp.sha", FieldSpec { kind: Mac, match_field: ArpSha }),
            ("arp.tha", FieldSpec { kind: Mac, match_field: ArpTha }),
            ("arp.op", FieldSpec { kind: Int, match_field: ArpOp }),
            ("icmp6.type", FieldSpec { kind: Int, match_field: Icmp6Type }),
            ("nd.target", FieldSpec { kind: Ipv6, match_field: NdTarget }),
            ("nd.sll", FieldSpec { kind: Mac, match_field: NdSll }),
            ("nd.tll", FieldSpec { kind: Mac, match_field: NdTll }),
            ("ip.ttl", FieldSpec { kind: Int, match_field: NwTtl }),
            ("vlan.tci", FieldSpec { kind: Int, match_field: VlanTci }),
        ];
        Self(entries.iter().copied().collect())
    }
}
