//! Structured OpenFlow action representation emitted by the action
//! encoder (§4.4) and the LB/port-security generators (§4.8, §4.9).
//!
//! The real action/expression library (out of scope, §1) emits raw
//! Nicira-extended OpenFlow action lists; here actions are kept as a
//! small tagged union that every generator in this crate can construct
//! and a test double can assert on, matching the "no dynamic dispatch
//! required internally" design note (§9).

use compact_str::CompactString;

use crate::ofmatch::{MatchField, MatchValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfAction {
    /// `resubmit(, table)` to continue the logical pipeline. Carries the
    /// already-resolved physical table number (`TableMap` does the
    /// `PhysTable` lookup at the point the action is constructed) rather
    /// than the abstract table name, since a resubmit target is often a
    /// computed logical-table offset with no `PhysTable` variant of its
    /// own (§4.5 "pipeline_table").
    Resubmit { table: u8 },
    /// `load`/`set_field` onto a register or header field.
    SetField { field: MatchField, value: MatchValue },
    Output(OutputSpec),
    Drop,
    /// One clause of an OpenFlow conjunction (§4.2, §4.8).
    Conjunction { id: u32, clause: u8, n_clauses: u8 },
    /// `ct(commit, nat(...))`, used by the hairpin SNAT rules (§4.8).
    CtCommitNat(NatAction),
    /// `port_sec_failed = 1` set by the ingress port-security defaults (§4.9).
    SetPortSecFailed,
    Learn(Box<LearnAction>),
    /// Passthrough for action text produced by the action encoder that
    /// this crate does not model structurally (e.g. an opaque controller
    /// action). Kept narrow and rare; every action needed by §4 and §8 is
    /// one of the structured variants above.
    Note(CompactString),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSpec {
    Port(u32),
    InPort,
    Flood,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Snat,
    Dnat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatAction {
    pub kind: NatKind,
    pub zone: CtZone,
    pub ip: std::net::IpAddr,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtZone {
    Snat,
    Dnat,
}

/// A minimal model of an OpenFlow `learn` action (§4.8): when the
/// detection rule hits, it plants a reply-side rule into `table` matching
/// `match_fields` (each either copied from the triggering packet's field
/// or a literal) and running `actions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnAction {
    pub table: u8,
    pub priority: u16,
    pub idle_timeout: u16,
    pub match_fields: Vec<(MatchField, LearnSrc)>,
    pub actions: Vec<OfAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnSrc {
    /// Copy from the same field on the triggering packet.
    FromField(MatchField),
    /// Copy from a different field on the triggering packet (used to
    /// swap src/dst when planting the reply rule).
    FromOtherField(MatchField),
    Literal(MatchValue),
}
