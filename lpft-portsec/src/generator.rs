//! Ingress/egress port-security rule generation (§4.9).

use std::net::{Ipv4Addr, Ipv6Addr};

use lpft_core::{DesiredFlow, FlowId, MatchField, MatchValue, OfAction, OfMatch, PhysTable, TableMap};

use crate::model::{PortSecEntry, PortSecPort};

const BROADCAST_MAC: [u8; 6] = [0xff; 6];

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    }
}

fn is_network_address_v4(addr: Ipv4Addr, prefix: u8) -> bool {
    u32::from(addr) & v4_mask(prefix) == u32::from(addr)
}

fn match_v4_prefix(m: &mut OfMatch, field: MatchField, addr: Ipv4Addr, prefix: u8) {
    if prefix == 32 || !is_network_address_v4(addr, prefix) {
        m.set(field, MatchValue::Ipv4(addr));
    } else {
        m.set(field, MatchValue::Ipv4Masked(addr, Ipv4Addr::from(v4_mask(prefix))));
    }
}

fn flow(owner: FlowId, table: u8, priority: u16, r#match: OfMatch, actions: Vec<OfAction>) -> DesiredFlow {
    DesiredFlow { table_id: table, priority, r#match, actions, cookie: lpft_core::cookie_of(owner), owner, as_tag: None }
}

/// All `DesiredFlow`s for one local port's configured `port_security`
/// entries. `owner` is the owning `PortBinding`'s id, used as the cookie
/// source; every port-security flow for one port shares its cookie.
pub fn generate(owner: FlowId, port: PortSecPort, entries: &[PortSecEntry], tables: &TableMap) -> Vec<DesiredFlow> {
    let mut out = Vec::new();
    out.extend(ingress_defaults(owner, port, tables));
    out.extend(nd_defaults(owner, port, tables));
    out.extend(egress_defaults(owner, port, tables));

    for entry in entries {
        if entry.has_no_addrs() {
            out.push(no_ip_allow(owner, port, entry, tables));
            continue;
        }
        out.extend(ipv4_allow(owner, port, entry, tables));
        if !entry.v4.is_empty() {
            out.push(arp_allow(owner, port, entry, tables));
        }
        out.extend(ipv6_allow(owner, port, entry, tables));
        out.extend(ipv6_nd_allow(owner, port, entry, tables));
        out.extend(egress_allow(owner, port, entry, tables));
    }

    out
}

fn inport_match(port: PortSecPort) -> OfMatch {
    OfMatch::new().with(MatchField::LogInport, MatchValue::U32(port.inport_tag))
}

fn ingress_defaults(owner: FlowId, port: PortSecPort, tables: &TableMap) -> Vec<DesiredFlow> {
    let main = tables.get(PhysTable::ChkInPortSec);
    let nd = tables.get(PhysTable::ChkInPortSecNd);
    vec![
        flow(owner, main, 80, inport_match(port), vec![OfAction::SetPortSecFailed]),
        flow(
            owner,
            main,
            95,
            inport_match(port).with(MatchField::EthType, MatchValue::U16(0x0806)),
            vec![OfAction::Resubmit { table: nd }],
        ),
    ]
}

fn nd_defaults(owner: FlowId, port: PortSecPort, tables: &TableMap) -> Vec<DesiredFlow> {
    let nd = tables.get(PhysTable::ChkInPortSecNd);
    vec![
        flow(
            owner,
            nd,
            80,
            inport_match(port).with(MatchField::EthType, MatchValue::U16(0x0806)),
            vec![OfAction::SetPortSecFailed],
        ),
        flow(
            owner,
            nd,
            80,
            inport_match(port)
                .with(MatchField::EthType, MatchValue::U16(0x86dd))
                .with(MatchField::Icmp6Type, MatchValue::U8(136))
                .with(MatchField::NwTtl, MatchValue::U8(255)),
            vec![OfAction::SetPortSecFailed],
        ),
        // NS allow works around a lower-level classifier bug; the ideal
        // behavior is default-drop here like the NA rule above.
        flow(
            owner,
            nd,
            80,
            inport_match(port)
                .with(MatchField::EthType, MatchValue::U16(0x86dd))
                .with(MatchField::Icmp6Type, MatchValue::U8(135))
                .with(MatchField::NwTtl, MatchValue::U8(255)),
            vec![OfAction::Resubmit { table: tables.get(PhysTable::MacBinding) }],
        ),
    ]
}

fn no_ip_allow(owner: FlowId, port: PortSecPort, entry: &PortSecEntry, tables: &TableMap) -> DesiredFlow {
    let m = inport_match(port).with(MatchField::EthSrc, MatchValue::Mac(entry.mac));
    flow(owner, tables.get(PhysTable::ChkInPortSec), 90, m, vec![OfAction::Resubmit { table: tables.get(PhysTable::MacBinding) }])
}

fn ipv4_allow(owner: FlowId, port: PortSecPort, entry: &PortSecEntry, tables: &TableMap) -> Vec<DesiredFlow> {
    let main = tables.get(PhysTable::ChkInPortSec);
    let next = tables.get(PhysTable::MacBinding);
    let mut out = Vec::new();

    for &(addr, prefix) in &entry.v4 {
        let mut m = inport_match(port)
            .with(MatchField::EthSrc, MatchValue::Mac(entry.mac))
            .with(MatchField::EthType, MatchValue::U16(0x0800));
        match_v4_prefix(&mut m, MatchField::Ip4Src, addr, prefix);
        out.push(flow(owner, main, 90, m, vec![OfAction::Resubmit { table: next }]));
    }

    let dhcp = inport_match(port)
        .with(MatchField::EthSrc, MatchValue::Mac(entry.mac))
        .with(MatchField::EthType, MatchValue::U16(0x0800))
        .with(MatchField::IpProto, MatchValue::U8(17))
        .with(MatchField::Ip4Src, MatchValue::Ipv4(Ipv4Addr::UNSPECIFIED))
        .with(MatchField::Ip4Dst, MatchValue::Ipv4(Ipv4Addr::BROADCAST))
        .with(MatchField::UdpSrc, MatchValue::U16(68))
        .with(MatchField::UdpDst, MatchValue::U16(67));
    out.push(flow(owner, main, 90, dhcp, vec![OfAction::Resubmit { table: next }]));

    out
}

fn arp_allow(owner: FlowId, port: PortSecPort, entry: &PortSecEntry, tables: &TableMap) -> DesiredFlow {
    let nd = tables.get(PhysTable::ChkInPortSecNd);
    let mut m = inport_match(port)
        .with(MatchField::EthType, MatchValue::U16(0x0806))
        .with(MatchField::ArpSha, MatchValue::Mac(entry.mac));
    // With a single v4 address the match can pin `arp.spa` directly;
    // multiple addresses would need a conjunction the generator doesn't
    // build here since a port rarely has more than one.
    if entry.v4.len() == 1 {
        let (addr, prefix) = entry.v4[0];
        match_v4_prefix(&mut m, MatchField::ArpSpa, addr, prefix);
    }
    flow(owner, nd, 90, m, vec![OfAction::Resubmit { table: tables.get(PhysTable::MacBinding) }])
}

fn ipv6_allow(owner: FlowId, port: PortSecPort, entry: &PortSecEntry, tables: &TableMap) -> Vec<DesiredFlow> {
    let main = tables.get(PhysTable::ChkInPortSec);
    let nd = tables.get(PhysTable::ChkInPortSecNd);
    let next = tables.get(PhysTable::MacBinding);
    let mut out = Vec::new();

    for &(addr, prefix) in &entry.v6 {
        let mut m = inport_match(port)
            .with(MatchField::EthSrc, MatchValue::Mac(entry.mac))
            .with(MatchField::EthType, MatchValue::U16(0x86dd));
        if prefix == 128 {
            m.set(MatchField::Ip6Src, MatchValue::Ipv6(addr));
        } else {
            m.set(MatchField::Ip6Src, MatchValue::Ipv6Masked(addr, Ipv6Addr::from(v6_mask(prefix))));
        }
        out.push(flow(owner, main, 90, m, vec![OfAction::Resubmit { table: next }]));
    }

    let link_local = inport_match(port)
        .with(MatchField::EthSrc, MatchValue::Mac(entry.mac))
        .with(MatchField::EthType, MatchValue::U16(0x86dd))
        .with(MatchField::Ip6Src, MatchValue::Ipv6Masked(fe80(), Ipv6Addr::from(v6_mask(64))));
    out.push(flow(owner, main, 90, link_local, vec![OfAction::Resubmit { table: next }]));

    for t in [131u8, 143u8] {
        let mld = inport_match(port)
            .with(MatchField::EthType, MatchValue::U16(0x86dd))
            .with(MatchField::Ip6Src, MatchValue::Ipv6(Ipv6Addr::UNSPECIFIED))
            .with(MatchField::Ip6Dst, MatchValue::Ipv6Masked(ff02(), Ipv6Addr::from(v6_mask(16))))
            .with(MatchField::Icmp6Type, MatchValue::U8(t));
        out.push(flow(owner, main, 90, mld, vec![OfAction::Resubmit { table: next }]));
    }

    let to_nd = inport_match(port)
        .with(MatchField::EthType, MatchValue::U16(0x86dd))
        .with(MatchField::Icmp6Type, MatchValue::U8(135));
    out.push(flow(owner, main, 90, to_nd, vec![OfAction::Resubmit { table: nd }]));

    out
}

fn ipv6_nd_allow(owner: FlowId, port: PortSecPort, entry: &PortSecEntry, tables: &TableMap) -> Vec<DesiredFlow> {
    let nd = tables.get(PhysTable::ChkInPortSecNd);
    let next = tables.get(PhysTable::MacBinding);
    let mut out = Vec::new();

    for sll in [[0u8; 6], entry.mac] {
        let m = inport_match(port)
            .with(MatchField::EthType, MatchValue::U16(0x86dd))
            .with(MatchField::Icmp6Type, MatchValue::U8(135))
            .with(MatchField::NdSll, MatchValue::Mac(sll));
        out.push(flow(owner, nd, 90, m, vec![OfAction::Resubmit { table: next }]));
    }

    for tll in [[0u8; 6], entry.mac] {
        if entry.v6.is_empty() {
            let m = inport_match(port)
                .with(MatchField::EthType, MatchValue::U16(0x86dd))
                .with(MatchField::Icmp6Type, MatchValue::U8(136))
                .with(MatchField::NdTll, MatchValue::Mac(tll));
            out.push(flow(owner, nd, 90, m, vec![OfAction::Resubmit { table: next }]));
            continue;
        }
        for &(addr, _) in &entry.v6 {
            let m = inport_match(port)
                .with(MatchField::EthType, MatchValue::U16(0x86dd))
                .with(MatchField::Icmp6Type, MatchValue::U8(136))
                .with(MatchField::NdTll, MatchValue::Mac(tll))
                .with(MatchField::NdTarget, MatchValue::Ipv6(addr));
            out.push(flow(owner, nd, 90, m, vec![OfAction::Resubmit { table: next }]));
        }
        let lla = inport_match(port)
            .with(MatchField::EthType, MatchValue::U16(0x86dd))
            .with(MatchField::Icmp6Type, MatchValue::U8(136))
            .with(MatchField::NdTll, MatchValue::Mac(tll))
            .with(MatchField::NdTarget, MatchValue::Ipv6Masked(fe80(), Ipv6Addr::from(v6_mask(64))));
        out.push(flow(owner, nd, 90, lla, vec![OfAction::Resubmit { table: next }]));
    }

    out
}

fn egress_defaults(owner: FlowId, port: PortSecPort, tables: &TableMap) -> Vec<DesiredFlow> {
    let out_table = tables.get(PhysTable::ChkOutPortSec);
    let m = OfMatch::new().with(MatchField::LogOutport, MatchValue::U32(port.outport_tag));
    vec![flow(owner, out_table, 80, m, vec![OfAction::Drop])]
}

fn egress_allow(owner: FlowId, port: PortSecPort, entry: &PortSecEntry, tables: &TableMap) -> Vec<DesiredFlow> {
    let out_table = tables.get(PhysTable::ChkOutPortSec);
    let next = tables.get(PhysTable::LookupFdb);
    let mut out = Vec::new();
    let outport = MatchField::LogOutport;

    let mut dsts_v4: Vec<MatchValue> = entry.v4.iter().map(|&(a, _)| MatchValue::Ipv4(a)).collect();
    dsts_v4.push(MatchValue::Ipv4(Ipv4Addr::BROADCAST));
    for &(addr, prefix) in &entry.v4 {
        if prefix < 32 {
            dsts_v4.push(MatchValue::Ipv4(broadcast_of(addr, prefix)));
        }
    }
    dsts_v4.push(MatchValue::Ipv4Masked(Ipv4Addr::new(224, 0, 0, 0), Ipv4Addr::new(240, 0, 0, 0)));
    for v in dsts_v4 {
        let m = OfMatch::new()
            .with(outport, MatchValue::U32(port.outport_tag))
            .with(MatchField::EthDst, MatchValue::Mac(entry.mac))
            .with(MatchField::EthType, MatchValue::U16(0x0800))
            .with(MatchField::Ip4Dst, v);
        out.push(flow(owner, out_table, 90, m, vec![OfAction::Resubmit { table: next }]));
    }

    let mut dsts_v6: Vec<MatchValue> = entry.v6.iter().map(|&(a, _)| MatchValue::Ipv6(a)).collect();
    dsts_v6.push(MatchValue::Ipv6Masked(fe80(), Ipv6Addr::from(v6_mask(64))));
    dsts_v6.push(MatchValue::Ipv6Masked(Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), Ipv6Addr::from(v6_mask(8))));
    for v in dsts_v6 {
        let m = OfMatch::new()
            .with(outport, MatchValue::U32(port.outport_tag))
            .with(MatchField::EthDst, MatchValue::Mac(entry.mac))
            .with(MatchField::EthType, MatchValue::U16(0x86dd))
            .with(MatchField::Ip6Dst, v);
        out.push(flow(owner, out_table, 90, m, vec![OfAction::Resubmit { table: next }]));
    }

    let bcast = OfMatch::new().with(outport, MatchValue::U32(port.outport_tag)).with(MatchField::EthDst, MatchValue::Mac(BROADCAST_MAC));
    out.push(flow(owner, out_table, 90, bcast, vec![OfAction::Resubmit { table: next }]));

    out
}

fn broadcast_of(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = v4_mask(prefix);
    Ipv4Addr::from(u32::from(addr) | !mask)
}

fn fe80() -> Ipv6Addr {
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0)
}

fn ff02() -> Ipv6Addr {
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn port() -> PortSecPort {
        PortSecPort { inport_tag: 3, outport_tag: 3 }
    }

    fn entry() -> PortSecEntry {
        PortSecEntry { mac: [0x02, 0, 0, 0, 0, 1], v4: vec![("10.0.0.5".parse().unwrap(), 24)], v6: vec![] }
    }

    #[test]
    fn no_addr_entry_allows_by_mac_only() {
        let tables = TableMap::default();
        let f = no_ip_allow(Uuid::new_v4(), port(), &PortSecEntry { mac: [1; 6], v4: vec![], v6: vec![] }, &tables);
        assert!(f.r#match.get(&MatchField::Ip4Src).is_none());
        assert_eq!(f.r#match.get(&MatchField::EthSrc), Some(&MatchValue::Mac([1; 6])));
    }

    #[test]
    fn v4_allow_keeps_host_addr_exact() {
        // 10.0.0.5/24 has non-zero host bits, so the match stays exact
        // rather than widening to the whole /24.
        let tables = TableMap::default();
        let flows = ipv4_allow(Uuid::new_v4(), port(), &entry(), &tables);
        assert_eq!(flows[0].r#match.get(&MatchField::Ip4Src), Some(&MatchValue::Ipv4("10.0.0.5".parse().unwrap())));
    }

    #[test]
    fn v4_allow_masks_network_addr() {
        let tables = TableMap::default();
        let net_entry = PortSecEntry { mac: entry().mac, v4: vec![("10.0.1.0".parse().unwrap(), 24)], v6: vec![] };
        let flows = ipv4_allow(Uuid::new_v4(), port(), &net_entry, &tables);
        assert_eq!(
            flows[0].r#match.get(&MatchField::Ip4Src),
            Some(&MatchValue::Ipv4Masked("10.0.1.0".parse().unwrap(), "255.255.255.0".parse().unwrap()))
        );
    }

    #[test]
    fn v4_allow_emits_dhcp_discover_flow() {
        let tables = TableMap::default();
        let flows = ipv4_allow(Uuid::new_v4(), port(), &entry(), &tables);
        assert!(flows.iter().any(|f| f.r#match.get(&MatchField::UdpDst) == Some(&MatchValue::U16(67))));
    }

    #[test]
    fn generate_covers_defaults_and_entry_rules() {
        let tables = TableMap::default();
        let flows = generate(Uuid::new_v4(), port(), &[entry()], &tables);
        assert!(flows.iter().any(|f| matches!(f.actions.as_slice(), [OfAction::SetPortSecFailed]) && f.priority == 80));
        assert!(flows.iter().any(|f| f.table_id == tables.get(PhysTable::ChkOutPortSec) && f.priority == 80));
    }
}
