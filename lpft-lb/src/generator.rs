//! Hairpin detection, reply, and SNAT rule generation (§4.8).

use std::net::IpAddr;

use lpft_core::{
    cookie_of, CtZone, DesiredFlow, LearnAction, LearnSrc, LogFlagBit, MatchField, MatchValue,
    NatAction, NatKind, OfAction, OfMatch, PhysTable, TableMap,
};

use crate::id_pool::HairpinIdPool;
use crate::model::{Backend, LoadBalancer};

fn eth_type(ip: IpAddr) -> u16 {
    match ip {
        IpAddr::V4(_) => 0x0800,
        IpAddr::V6(_) => 0x86dd,
    }
}

fn ip_value(ip: IpAddr) -> MatchValue {
    match ip {
        IpAddr::V4(a) => MatchValue::Ipv4(a),
        IpAddr::V6(a) => MatchValue::Ipv6(a),
    }
}

fn ip_src_field(ip: IpAddr) -> MatchField {
    match ip {
        IpAddr::V4(_) => MatchField::Ip4Src,
        IpAddr::V6(_) => MatchField::Ip6Src,
    }
}

fn ip_dst_field(ip: IpAddr) -> MatchField {
    match ip {
        IpAddr::V4(_) => MatchField::Ip4Dst,
        IpAddr::V6(_) => MatchField::Ip6Dst,
    }
}

fn ct_orig_dst_field(ip: IpAddr) -> MatchField {
    match ip {
        IpAddr::V4(_) => MatchField::CtOrigDip4,
        IpAddr::V6(_) => MatchField::CtOrigDip6,
    }
}

/// `(src, dst)` transport-port fields for a protocol number, when it's
/// one that carries ports at all. `None` for anything else (ICMP and so
/// on), in which case a port constraint just isn't applicable.
fn port_fields(protocol: u8) -> Option<(MatchField, MatchField)> {
    match protocol {
        6 => Some((MatchField::TcpSrc, MatchField::TcpDst)),
        17 => Some((MatchField::UdpSrc, MatchField::UdpDst)),
        132 => Some((MatchField::SctpSrc, MatchField::SctpDst)),
        _ => None,
    }
}

/// Emits every hairpin-related `DesiredFlow` for one load balancer
/// (§4.8). `pool` supplies the conjunction id used by the `CT_SNAT_HAIRPIN`
/// clauses, stable across ticks so unrelated recompiles don't reshuffle it.
/// `legacy_compat` is the chassis-wide compatibility flag (§10.2); it's
/// OR'd with the row's own `legacy_ct_label_compat` so a fleet-wide
/// rollout doesn't need to touch every `LoadBalancer` row.
pub fn generate(lb: &LoadBalancer, tables: &TableMap, pool: &mut HairpinIdPool, legacy_compat: bool) -> Vec<DesiredFlow> {
    let mut out = Vec::new();
    let cookie = cookie_of(lb.id);
    let legacy_compat = legacy_compat || lb.legacy_ct_label_compat;

    for backend in &lb.backends {
        out.extend(detection_flows(lb, backend, tables, cookie, legacy_compat));
    }

    if let Some(snat_ip) = lb.hairpin_snat_ip {
        let conj_id = pool.get_or_alloc(&lb.name);
        out.extend(snat_conjunction_flows(lb, snat_ip, conj_id, tables, cookie));
    } else {
        pool.release(&lb.name);
        out.push(snat_direct_flow(lb, lb.vip, tables, cookie));
    }

    out
}

fn detection_flows(lb: &LoadBalancer, backend: &Backend, tables: &TableMap, cookie: u32, legacy_compat: bool) -> Vec<DesiredFlow> {
    let mut flows = Vec::new();
    let table = tables.get(PhysTable::ChkLbHairpin);
    let reply_table = tables.get(PhysTable::ChkLbHairpinReply);
    let ip = backend.ip;
    let ports = lb.protocol.and_then(port_fields);

    let base_match = |natted_field: MatchField| {
        let mut m = OfMatch::new();
        m.set(natted_field, MatchValue::U8(1))
            .set(MatchField::EthType, MatchValue::U16(eth_type(ip)))
            .set(ip_src_field(ip), ip_value(ip))
            .set(ip_dst_field(ip), ip_value(ip))
            .set(ct_orig_dst_field(lb.vip), ip_value(lb.vip));
        if let Some(proto) = lb.protocol {
            m.set(MatchField::IpProto, MatchValue::U8(proto));
        }
        if let (Some((_, dst_field)), Some(port)) = (ports, backend.port) {
            m.set(dst_field, MatchValue::U16(port));
        }
        m
    };

    let mut reply_match_fields = vec![
        (MatchField::Metadata, LearnSrc::FromField(MatchField::Metadata)),
        (MatchField::EthType, LearnSrc::FromField(MatchField::EthType)),
        (ip_src_field(ip), LearnSrc::Literal(ip_value(ip))),
        (ip_dst_field(lb.vip), LearnSrc::Literal(ip_value(lb.vip))),
    ];
    if let Some(proto) = lb.protocol {
        reply_match_fields.push((MatchField::IpProto, LearnSrc::Literal(MatchValue::U8(proto))));
    }
    if let (Some((src_field, _)), Some(port)) = (ports, backend.port) {
        reply_match_fields.push((src_field, LearnSrc::Literal(MatchValue::U16(port))));
    }
    let reply_rule = OfAction::Learn(Box::new(LearnAction {
        table: reply_table,
        priority: 100,
        idle_timeout: 30,
        match_fields: reply_match_fields,
        actions: vec![OfAction::SetField {
            field: MatchField::LogFlags,
            value: MatchValue::U32(LogFlagBit::LookupLbHairpin as u32),
        }],
    }));
    let actions = vec![
        OfAction::SetField {
            field: MatchField::LogFlags,
            value: MatchValue::U32(LogFlagBit::LookupLbHairpin as u32),
        },
        reply_rule,
    ];

    flows.push(DesiredFlow {
        table_id: table,
        priority: 100,
        r#match: base_match(MatchField::CtMarkNatted),
        actions: actions.clone(),
        cookie,
        owner: lb.id,
        as_tag: None,
    });

    if legacy_compat {
        flows.push(DesiredFlow {
            table_id: table,
            priority: 100,
            r#match: base_match(MatchField::CtLabelNatted),
            actions,
            cookie,
            owner: lb.id,
            as_tag: None,
        });
    }

    flows
}

fn vip_port_match(m: &mut OfMatch, lb: &LoadBalancer) {
    if let Some(proto) = lb.protocol {
        m.set(MatchField::IpProto, MatchValue::U8(proto));
        if let (Some((_, dst_field)), Some(port)) = (port_fields(proto), lb.vip_port) {
            m.set(dst_field, MatchValue::U16(port));
        }
    }
}

fn snat_direct_flow(lb: &LoadBalancer, vip: IpAddr, tables: &TableMap, cookie: u32) -> DesiredFlow {
    let mut m = OfMatch::new();
    m.set(MatchField::EthType, MatchValue::U16(eth_type(vip))).set(ip_dst_field(vip), ip_value(vip));
    vip_port_match(&mut m, lb);
    DesiredFlow {
        table_id: tables.get(PhysTable::CtSnatHairpin),
        priority: 100,
        r#match: m,
        actions: vec![OfAction::CtCommitNat(NatAction {
            kind: NatKind::Snat,
            zone: CtZone::Snat,
            ip: vip,
            port: None,
        })],
        cookie,
        owner: lb.id,
        as_tag: None,
    }
}

fn snat_conjunction_flows(
    lb: &LoadBalancer,
    snat_ip: IpAddr,
    conj_id: u32,
    tables: &TableMap,
    cookie: u32,
) -> Vec<DesiredFlow> {
    let table = tables.get(PhysTable::CtSnatHairpin);
    let mut out = Vec::new();

    // Per-VIP clause (1 of 2). Keyed only on the VIP, not the datapath, so
    // identical VIPs across LBs collapse to one flow (the "per-VIP
    // stripping" this table exists for) once the sink merges conjunction
    // actions that land on the same match.
    let mut vip_match = OfMatch::new();
    vip_match
        .set(MatchField::EthType, MatchValue::U16(eth_type(lb.vip)))
        .set(ip_dst_field(lb.vip), ip_value(lb.vip));
    vip_port_match(&mut vip_match, lb);
    out.push(DesiredFlow {
        table_id: table,
        priority: 200,
        r#match: vip_match,
        actions: vec![OfAction::Conjunction { id: conj_id, clause: 1, n_clauses: 2 }],
        cookie,
        owner: lb.id,
        as_tag: None,
    });

    // Per-datapath clause (0 of 2): one per attached datapath.
    for dp in &lb.datapaths {
        let mut dp_match = OfMatch::new();
        dp_match.set(MatchField::Metadata, MatchValue::U64(dp_tunnel_key(dp)));
        out.push(DesiredFlow {
            table_id: table,
            priority: 200,
            r#match: dp_match,
            actions: vec![OfAction::Conjunction { id: conj_id, clause: 0, n_clauses: 2 }],
            cookie,
            owner: lb.id,
            as_tag: None,
        });
    }

    // Both clauses satisfied -> commit + SNAT.
    let mut conj_match = OfMatch::new();
    conj_match.set(MatchField::ConjId, MatchValue::U32(conj_id));
    out.push(DesiredFlow {
        table_id: table,
        priority: 200,
        r#match: conj_match,
        actions: vec![OfAction::CtCommitNat(NatAction {
            kind: NatKind::Snat,
            zone: CtZone::Snat,
            ip: snat_ip,
            port: None,
        })],
        cookie,
        owner: lb.id,
        as_tag: None,
    });

    out
}

/// Placeholder datapath key until the engine supplies the real
/// `LocalDatapath::tunnel_key`; distinguishes datapaths without needing a
/// lookup table here.
fn dp_tunnel_key(dp: &lpft_core::DatapathId) -> u64 {
    let bytes = dp.as_bytes();
    u64::from_be_bytes(bytes[8..16].try_into().unwrap())
}
