use std::net::IpAddr;

use compact_str::CompactString;
use lpft_core::{DatapathId, FlowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

/// `LoadBalancer`, §4.8.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub id: FlowId,
    pub name: CompactString,
    pub vip: IpAddr,
    pub vip_port: Option<u16>,
    pub protocol: Option<u8>,
    pub backends: Vec<Backend>,
    pub hairpin_snat_ip: Option<IpAddr>,
    /// Emit the legacy `ct_label.natted`-keyed detection flow alongside
    /// the `ct_mark.natted` one.
    pub legacy_ct_label_compat: bool,
    pub datapaths: Vec<DatapathId>,
}
