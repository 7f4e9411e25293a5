//! Action-buffer-to-`OfAction` encoding (§4.4): resolves `next`/`output`
//! against the table map and a port-lookup callback, derives the
//! `prereqs` expression `AND`-combined into the match, and interns the
//! controller meter name.

use compact_str::CompactString;
use lpft_core::{CtZone, Direction, FlowId, MatchField, MatchValue, NatAction, NatKind, OfAction, TableMap};
use lpft_expr::{CmpOp, Expr, Value};

use crate::ast::{ActionBuffer, Stmt};
use crate::meter::MeterTable;

/// §4.3 callback #1: resolves a logical port name to its local OpenFlow
/// port number. `None` means the port isn't known/local yet (§7 "unknown
/// port").
pub trait PortLookup {
    fn lookup(&self, name: &str) -> Option<u32>;
}

pub struct EncodeEnv<'a> {
    pub tables: &'a TableMap,
    pub direction: Direction,
    pub logical_table: u8,
    pub ports: &'a dyn PortLookup,
    pub ct_zone: CtZone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub actions: Vec<OfAction>,
    pub prereqs: Expr,
    pub meter: Option<u32>,
    /// Port names referenced by `output(...)` that did not resolve
    /// locally (§7): recorded so the caller can push a `PortBinding` ref.
    pub unresolved_ports: Vec<CompactString>,
}

fn value_to_nat_ip(v: &Value) -> anyhow::Result<std::net::IpAddr> {
    match v {
        Value::Ipv4(a) => Ok(std::net::IpAddr::V4(*a)),
        Value::Ipv6(a) => Ok(std::net::IpAddr::V6(*a)),
        _ => anyhow::bail!("ct_dnat/ct_snat argument must be an IP address"),
    }
}

/// Encodes one parsed action buffer. `meter_name`/`flow` are used to
/// intern the controller meter (§4.4); pass `None` for `meter_name` if
/// the logical flow doesn't carry one.
pub fn encode(
    buf: &ActionBuffer,
    env: &EncodeEnv,
    meter_name: Option<&str>,
    flow: FlowId,
    meters: &mut MeterTable,
) -> anyhow::Result<EncodeOutcome> {
    let mut actions = Vec::new();
    let mut prereqs = Expr::True;
    let mut unresolved_ports = Vec::new();
    let ingress = env.direction == Direction::Ingress;

    for stmt in &buf.0 {
        match stmt {
            Stmt::Next(n) => {
                let target = n.unwrap_or(env.logical_table + 1);
                actions.push(OfAction::Resubmit { table: env.tables.pipeline_table(ingress, target) });
            }
            Stmt::Drop => actions.push(OfAction::Drop),
            Stmt::Output(name) => match env.ports.lookup(name) {
                Some(ofport) => actions.push(OfAction::Output(lpft_core::OutputSpec::Port(ofport))),
                None => unresolved_ports.push(name.clone()),
            },
            Stmt::SetReg(n, v) => {
                let value = match v {
                    Value::Int(i) => MatchValue::U32(*i as u32),
                    Value::Ipv4(a) => MatchValue::Ipv4(*a),
                    _ => anyhow::bail!("unsupported register value"),
                };
                actions.push(OfAction::SetField { field: MatchField::Reg(*n), value });
            }
            Stmt::CtNext | Stmt::CtCommit => {
                prereqs = prereqs.and(eth_type_ip_prereq());
                if matches!(stmt, Stmt::CtCommit) {
                    actions.push(OfAction::Note(CompactString::from("ct_commit")));
                }
            }
            Stmt::CtDnat(ip) => {
                prereqs = prereqs.and(eth_type_ip_prereq());
                let ip = match ip {
                    Some(v) => value_to_nat_ip(v)?,
                    None => anyhow::bail!("ct_dnat requires an address"),
                };
                actions.push(OfAction::CtCommitNat(NatAction {
                    kind: NatKind::Dnat,
                    zone: env.ct_zone,
                    ip,
                    port: None,
                }));
            }
            Stmt::CtSnat(ip) => {
                prereqs = prereqs.and(eth_type_ip_prereq());
                let ip = match ip {
                    Some(v) => value_to_nat_ip(v)?,
                    None => anyhow::bail!("ct_snat requires an address"),
                };
                actions.push(OfAction::CtCommitNat(NatAction {
                    kind: NatKind::Snat,
                    zone: env.ct_zone,
                    ip,
                    port: None,
                }));
            }
        }
    }

    let meter = match meter_name {
        Some(name) => meters.intern(name, flow),
        None => None,
    };

    Ok(EncodeOutcome { actions, prereqs, meter, unresolved_ports })
}

fn eth_type_ip_prereq() -> Expr {
    Expr::Cmp { field: "eth.type".into(), op: CmpOp::Eq, value: Value::Int(0x0800) }
}
