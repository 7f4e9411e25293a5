use std::net::{Ipv4Addr, Ipv6Addr};

/// One `port_security` entry decoded off a `PortBinding` row (§4.9): a MAC
/// plus the v4/v6 prefixes that MAC is allowed to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSecEntry {
    pub mac: [u8; 6],
    pub v4: Vec<(Ipv4Addr, u8)>,
    pub v6: Vec<(Ipv6Addr, u8)>,
}

impl PortSecEntry {
    pub fn has_no_addrs(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// The logical in/outport register values a local port binds to, plus its
/// datapath's link-local address needed by the IPv6 allow rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSecPort {
    pub inport_tag: u32,
    pub outport_tag: u32,
}
