//! Per-`(LogicalFlow, LocalDatapath)` compilation (§4.3-§4.5): runs the
//! expression and action pipelines, binds conjunction ids, builds
//! `OfMatch`es, and applies the local-port filter.

use std::collections::HashSet;

use compact_str::CompactString;
use fxhash::FxHashMap;
use lpft_actions::{encode, EncodeEnv, MeterTable, PortLookup};
use lpft_cache::{CacheEntry, LflowCache};
use lpft_conjid::ConjIdAllocator;
use lpft_core::{
    cookie_of, ConjId, DatapathId, DatapathRef, DesiredFlow, Direction, FlowId, LocalDatapath,
    LocalLport, LogicalFlow, MatchField, MatchValue, OfAction, OfMatch, PortBinding, RateLimiter,
    RefType, SkipReason, TableMap,
};
use lpft_expr::{self as expr, AddressSetMap, ChassisContext, HaGroupResolver, NormTerm, PortGroupMap, Symtab};
use lpft_reftracker::RefTracker;

/// Pre-normalize expression cached for datapath-*group* flows (§3): each
/// member datapath still needs its own `normalize` pass (conjunction ids
/// are per-member), so only the parse/simplify/chassis-resolution prefix
/// is worth keeping around.
#[derive(Debug, Clone)]
pub struct CachedExpr {
    expr: expr::Expr,
    chassis_refs: Vec<CompactString>,
}

/// Fully normalized state cached for single-datapath flows (§3, the
/// common case): reusable as-is once `validate_matches` confirms the
/// stored conjunction-id range is still live.
#[derive(Debug, Clone)]
pub struct CachedMatches {
    norm: expr::NormResult,
    refs: expr::RefSet,
    chassis_refs: Vec<CompactString>,
}

pub type FlowCache = LflowCache<CachedExpr, CachedMatches>;

/// How a compiled flow should be handed to the sink (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    Add,
    AddMetered(u32),
    /// Carries only a `conjunction(...)` action; merges with whatever
    /// else lands at the same `(table, priority, match)`.
    AddOrAppend,
}

#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub flow: DesiredFlow,
    pub emit: EmitKind,
}

#[derive(Debug)]
pub enum FlowOutcome {
    Compiled(Vec<CompiledFlow>),
    Skipped(SkipReason),
}

pub struct CompileEnv<'a> {
    pub symtab: &'a Symtab,
    pub tables: &'a TableMap,
    pub ports: &'a dyn PortLookup,
    pub ha_groups: &'a dyn HaGroupResolver,
    pub port_bindings: &'a FxHashMap<CompactString, PortBinding>,
    pub addr_sets: &'a AddressSetMap,
    pub port_groups: &'a PortGroupMap,
    pub local_lports: &'a HashSet<LocalLport>,
    pub chassis: &'a str,
}

fn bind_conj_id(alloc: &mut ConjIdAllocator, flow: FlowId, dp: DatapathId, n: u32) -> ConjId {
    match alloc.find(flow, dp) {
        Some(id) => id,
        None => alloc.alloc(flow, dp, n),
    }
}

/// `None` when the local-port filter drops this match (§4.5): the
/// logical datapath is a switch, the match names an in/outport that is
/// not in the chassis's local-lport set.
fn build_match(
    dp: &LocalDatapath,
    atoms: &[expr::Atom],
    direction: Direction,
    local_lports: &HashSet<LocalLport>,
) -> Option<OfMatch> {
    let mut m = OfMatch::new();
    m.set(MatchField::Metadata, MatchValue::U64(dp.tunnel_key.0));
    for atom in atoms {
        m.set(atom.field, atom.value);
    }

    if !dp.is_switch {
        return Some(m);
    }
    let port_field = if direction == Direction::Ingress { MatchField::LogInport } else { MatchField::LogOutport };
    match m.log_port(port_field) {
        Some(tag) if local_lports.contains(&LocalLport { datapath: dp.id, port_tag: tag }) => Some(m),
        Some(_) => None,
        None => Some(m),
    }
}

fn plain_flow(flow: &LogicalFlow, table: u8, m: OfMatch, actions: Vec<OfAction>, as_tag: Option<lpft_core::AsTag>) -> DesiredFlow {
    DesiredFlow { table_id: table, priority: flow.priority, r#match: m, actions, cookie: cookie_of(flow.id), owner: flow.id, as_tag }
}

#[allow(clippy::too_many_arguments)]
pub fn compile_flow(
    flow: &LogicalFlow,
    dp: &LocalDatapath,
    env: &CompileEnv,
    ref_tracker: &mut RefTracker,
    conj_alloc: &mut ConjIdAllocator,
    meters: &mut MeterTable,
    limiter: &mut RateLimiter,
    cache: &mut FlowCache,
    use_cache: bool,
) -> FlowOutcome {
    let action_buf = match lpft_actions::parse_actions(&flow.actions) {
        Ok(b) => b,
        Err(e) => {
            lpft_core::rl_warn!(limiter, "parse-error", "skipping flow {}: {e:#}", flow.id);
            return FlowOutcome::Skipped(SkipReason::ParseError);
        }
    };

    let encode_env = EncodeEnv {
        tables: env.tables,
        direction: flow.direction,
        logical_table: flow.logical_table,
        ports: env.ports,
        ct_zone: dp.common_nat_ct_zone(),
    };
    let encoded = match encode(&action_buf, &encode_env, flow.controller_meter.as_deref(), flow.id, meters) {
        Ok(o) => o,
        Err(e) => {
            lpft_core::rl_warn!(limiter, "parse-error", "skipping flow {}: action encode error: {e:#}", flow.id);
            return FlowOutcome::Skipped(SkipReason::ParseError);
        }
    };
    for name in &encoded.unresolved_ports {
        ref_tracker.add(RefType::PortBinding, name.clone(), flow.id, 1);
    }

    let chassis_ctx = ChassisContext { this_chassis: env.chassis, ports: env.port_bindings, ha_groups: env.ha_groups };
    let is_group = matches!(flow.datapath, DatapathRef::Group(_));

    // §3: a single-datapath flow's fully normalized state is reusable
    // as-is, so long as the conjunction-id range it was bound to is
    // still the one the allocator would hand back for this datapath.
    let cache_hit = if use_cache && !is_group && cache.validate_matches(flow.id, conj_alloc) {
        match cache.get(flow.id) {
            CacheEntry::Matches { norm, dp: cached_dp, .. } if *cached_dp == dp.id => Some(norm.clone()),
            _ => None,
        }
    } else {
        None
    };
    let from_cache = cache_hit.is_some();

    let (norm, refs, chassis_refs) = match cache_hit {
        Some(cached) => (cached.norm, cached.refs, cached.chassis_refs),
        None => {
            // A datapath-group flow's pre-normalize expression is the
            // same for every member; only `normalize` itself must be
            // re-run per member (its conjunction ids are per-datapath).
            let cached_expr = if use_cache && is_group {
                match cache.get(flow.id) {
                    CacheEntry::Expr { ast, .. } => Some(ast.clone()),
                    _ => None,
                }
            } else {
                None
            };

            let (resolved, chassis_refs) = match cached_expr {
                Some(c) => (c.expr, c.chassis_refs),
                None => {
                    let mut e = match expr::parse_match(&flow.r#match) {
                        Ok(e) => e,
                        Err(err) => {
                            lpft_core::rl_warn!(limiter, "parse-error", "skipping flow {}: {err:#}", flow.id);
                            return FlowOutcome::Skipped(SkipReason::ParseError);
                        }
                    };
                    e = e.and(encoded.prereqs.clone());
                    e = expr::simplify::simplify(e);
                    let mut chassis_refs = Vec::new();
                    e = expr::chassis::eval_chassis_resident(e, &chassis_ctx, &mut chassis_refs);
                    e = expr::simplify::simplify(e);
                    if use_cache && is_group {
                        let size_bytes = flow.r#match.len() * 2 + 64;
                        cache.insert_expr(
                            flow.id,
                            CachedExpr { expr: e.clone(), chassis_refs: chassis_refs.clone() },
                            size_bytes,
                        );
                    }
                    (e, chassis_refs)
                }
            };

            let (norm, refs) = match expr::normalize::normalize(&resolved, env.symtab, env.addr_sets, env.port_groups) {
                Ok(v) => v,
                Err(e) => {
                    lpft_core::rl_warn!(limiter, "annotation-error", "skipping flow {}: {e:#}", flow.id);
                    return FlowOutcome::Skipped(SkipReason::AnnotationError);
                }
            };
            (norm, refs, chassis_refs)
        }
    };
    for name in chassis_refs.clone() {
        ref_tracker.add(RefType::PortBinding, name, flow.id, 1);
    }
    for (name, count) in &refs.addr_sets {
        ref_tracker.add(RefType::AddressSet, name.clone(), flow.id, *count);
    }
    for name in &refs.port_groups {
        ref_tracker.add(RefType::PortGroup, name.clone(), flow.id, 1);
    }

    if norm.groups.len() > 1 {
        lpft_core::rl_warn!(
            limiter,
            "multi-conjunction",
            "skipping flow {}: more than one conjunction dimension group in a single match isn't supported",
            flow.id
        );
        return FlowOutcome::Skipped(SkipReason::ParseError);
    }

    if use_cache && !is_group && !from_cache {
        let (conj_id_offset, n_conjs) = if norm.groups.len() == 1 {
            let n = norm.groups[0].n_clauses as u32;
            (Some(bind_conj_id(conj_alloc, flow.id, dp.id, n)), n)
        } else {
            (None, 0)
        };
        let size_bytes = norm.terms.len() * 128 + 64;
        cache.insert_matches(
            flow.id,
            dp.id,
            CachedMatches { norm: norm.clone(), refs: refs.clone(), chassis_refs: chassis_refs.clone() },
            conj_id_offset,
            n_conjs,
            size_bytes,
        );
    }

    let base_table = env.tables.pipeline_table(flow.direction == Direction::Ingress, flow.logical_table);
    let mut out = Vec::new();

    for term in &norm.terms {
        match term {
            NormTerm::Plain(atoms) => {
                if let Some(m) = build_match(dp, atoms, flow.direction, env.local_lports) {
                    let as_tag = atoms.iter().find_map(|a| a.as_tag.clone());
                    let df = plain_flow(flow, base_table, m, encoded.actions.clone(), as_tag);
                    let emit = match encoded.meter {
                        Some(meter) => EmitKind::AddMetered(meter),
                        None => EmitKind::Add,
                    };
                    out.push(CompiledFlow { flow: df, emit });
                }
            }
            NormTerm::Conj { atoms, desc } => {
                let n = norm.groups[desc.group].n_clauses as u32;
                let first = bind_conj_id(conj_alloc, flow.id, dp.id, n);
                if let Some(m) = build_match(dp, atoms, flow.direction, env.local_lports) {
                    let as_tag = atoms.iter().find_map(|a| a.as_tag.clone());
                    let df = DesiredFlow {
                        table_id: base_table,
                        priority: flow.priority,
                        r#match: m,
                        actions: vec![OfAction::Conjunction { id: first.0, clause: desc.clause, n_clauses: desc.n_clauses }],
                        cookie: cookie_of(flow.id),
                        owner: flow.id,
                        as_tag,
                    };
                    out.push(CompiledFlow { flow: df, emit: EmitKind::AddOrAppend });
                }
            }
        }
    }

    for (group, shared_atoms) in &norm.action_terms {
        let n = norm.groups[*group].n_clauses as u32;
        let first = bind_conj_id(conj_alloc, flow.id, dp.id, n);
        if let Some(mut m) = build_match(dp, shared_atoms, flow.direction, env.local_lports) {
            m.set(MatchField::ConjId, MatchValue::U32(first.0));
            let df = plain_flow(flow, base_table, m, encoded.actions.clone(), None);
            let emit = match encoded.meter {
                Some(meter) => EmitKind::AddMetered(meter),
                None => EmitKind::Add,
            };
            out.push(CompiledFlow { flow: df, emit });
        }
    }

    FlowOutcome::Compiled(out)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use lpft_core::{Direction, IpNet, MatchValue, TableMap, TunnelKey};
    use lpft_expr::HaGroupResolver;
    use uuid::Uuid;

    use super::*;

    struct NoPorts;
    impl PortLookup for NoPorts {
        fn lookup(&self, _name: &str) -> Option<u32> {
            None
        }
    }

    struct NoHaGroups;
    impl HaGroupResolver for NoHaGroups {
        fn active_chassis(&self, _ha_group: &str) -> Option<&str> {
            None
        }
    }

    fn router_dp(tk: u64) -> LocalDatapath {
        LocalDatapath { id: Uuid::new_v4(), tunnel_key: TunnelKey(tk), is_switch: false, external_ids: Default::default() }
    }

    fn fixture<'a>(
        symtab: &'a Symtab,
        tables: &'a TableMap,
        ports: &'a NoPorts,
        ha: &'a NoHaGroups,
        port_bindings: &'a FxHashMap<CompactString, PortBinding>,
        addr_sets: &'a AddressSetMap,
        port_groups: &'a PortGroupMap,
        local_lports: &'a HashSet<LocalLport>,
    ) -> CompileEnv<'a> {
        CompileEnv { symtab, tables, ports, ha_groups: ha, port_bindings, addr_sets, port_groups, local_lports, chassis: "c1" }
    }

    fn lf(r#match: &str, actions: &str, table: u8, priority: u16, dp: DatapathId) -> LogicalFlow {
        LogicalFlow::new(Uuid::new_v4(), Direction::Ingress, table, priority, r#match, actions, lpft_core::DatapathRef::Single(dp))
    }

    #[test]
    fn scenario1_single_exact_match() {
        let symtab = Symtab::default();
        let tables = TableMap::default();
        let ports = NoPorts;
        let ha = NoHaGroups;
        let port_bindings = FxHashMap::default();
        let addr_sets = AddressSetMap::default();
        let port_groups = PortGroupMap::default();
        let local_lports = HashSet::default();
        let env = fixture(&symtab, &tables, &ports, &ha, &port_bindings, &addr_sets, &port_groups, &local_lports);

        let dp = router_dp(7);
        let flow = lf("ip4.dst==10.0.0.1", "next;", 3, 50, dp.id);

        let mut ref_tracker = RefTracker::new();
        let mut conj_alloc = ConjIdAllocator::new();
        let mut meters = MeterTable::new(64);
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        let mut cache = FlowCache::new(1024 * 1024);

        let outcome = compile_flow(&flow, &dp, &env, &mut ref_tracker, &mut conj_alloc, &mut meters, &mut limiter, &mut cache, true);
        let FlowOutcome::Compiled(flows) = outcome else { panic!("expected compiled output") };
        assert_eq!(flows.len(), 1);
        let cf = &flows[0];
        assert_eq!(cf.flow.table_id, tables.pipeline_table(true, 3));
        assert_eq!(cf.flow.priority, 50);
        assert_eq!(cf.flow.r#match.get(&MatchField::Metadata), Some(&MatchValue::U64(7)));
        assert_eq!(cf.flow.r#match.get(&MatchField::Ip4Dst), Some(&MatchValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(cf.flow.actions, vec![OfAction::Resubmit { table: tables.pipeline_table(true, 4) }]);
        assert_eq!(cf.emit, EmitKind::Add);
    }

    #[test]
    fn scenario2_address_set_disjunction_no_conjunction() {
        let symtab = Symtab::default();
        let tables = TableMap::default();
        let ports = NoPorts;
        let ha = NoHaGroups;
        let port_bindings = FxHashMap::default();
        let mut addr_sets = AddressSetMap::default();
        addr_sets.insert(
            "s".into(),
            vec![
                IpNet::host_v4(Ipv4Addr::new(1, 1, 1, 1)),
                IpNet::host_v4(Ipv4Addr::new(2, 2, 2, 2)),
                IpNet::host_v4(Ipv4Addr::new(3, 3, 3, 3)),
            ],
        );
        let port_groups = PortGroupMap::default();
        let local_lports = HashSet::default();
        let env = fixture(&symtab, &tables, &ports, &ha, &port_bindings, &addr_sets, &port_groups, &local_lports);

        let dp = router_dp(1);
        let flow = lf("ip4.src==$s", "drop;", 0, 10, dp.id);

        let mut ref_tracker = RefTracker::new();
        let mut conj_alloc = ConjIdAllocator::new();
        let mut meters = MeterTable::new(64);
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        let mut cache = FlowCache::new(1024 * 1024);

        let outcome = compile_flow(&flow, &dp, &env, &mut ref_tracker, &mut conj_alloc, &mut meters, &mut limiter, &mut cache, true);
        let FlowOutcome::Compiled(flows) = outcome else { panic!("expected compiled output") };
        assert_eq!(flows.len(), 3);
        assert!(flows.iter().all(|cf| cf.emit == EmitKind::Add));
        assert!(flows.iter().all(|cf| cf.flow.as_tag.as_ref().map(|t| t.name == "s").unwrap_or(false)));
        assert_eq!(ref_tracker.lookup_by_symbol(RefType::AddressSet, "s").count(), 1);
    }

    #[test]
    fn scenario3_cross_set_cartesian_one_conjunction_group() {
        let symtab = Symtab::default();
        let tables = TableMap::default();
        let ports = NoPorts;
        let ha = NoHaGroups;
        let port_bindings = FxHashMap::default();
        let mut addr_sets = AddressSetMap::default();
        addr_sets.insert(
            "a".into(),
            vec![IpNet::host_v4(Ipv4Addr::new(1, 1, 1, 1)), IpNet::host_v4(Ipv4Addr::new(1, 1, 1, 2))],
        );
        addr_sets.insert(
            "b".into(),
            vec![IpNet::host_v4(Ipv4Addr::new(2, 2, 2, 1)), IpNet::host_v4(Ipv4Addr::new(2, 2, 2, 2))],
        );
        let port_groups = PortGroupMap::default();
        let local_lports = HashSet::default();
        let env = fixture(&symtab, &tables, &ports, &ha, &port_bindings, &addr_sets, &port_groups, &local_lports);

        let dp = router_dp(1);
        let flow = lf("ip4.src==$a && ip4.dst==$b", "drop;", 0, 10, dp.id);

        let mut ref_tracker = RefTracker::new();
        let mut conj_alloc = ConjIdAllocator::new();
        let mut meters = MeterTable::new(64);
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        let mut cache = FlowCache::new(1024 * 1024);

        let outcome = compile_flow(&flow, &dp, &env, &mut ref_tracker, &mut conj_alloc, &mut meters, &mut limiter, &mut cache, true);
        let FlowOutcome::Compiled(flows) = outcome else { panic!("expected compiled output") };

        let clause_flows: Vec<_> = flows.iter().filter(|cf| cf.emit == EmitKind::AddOrAppend).collect();
        let action_flows: Vec<_> = flows.iter().filter(|cf| cf.emit != EmitKind::AddOrAppend).collect();
        assert_eq!(clause_flows.len(), 4);
        assert_eq!(action_flows.len(), 1);
        assert_eq!(action_flows[0].flow.actions, vec![OfAction::Drop]);

        let conj_id = clause_flows
            .iter()
            .find_map(|cf| cf.flow.actions.iter().find_map(|a| match a {
                OfAction::Conjunction { id, .. } => Some(*id),
                _ => None,
            }))
            .expect("clause flow carries a conjunction action");
        assert!(clause_flows.iter().all(|cf| cf.flow.actions.iter().any(|a| matches!(a, OfAction::Conjunction { id, n_clauses: 2, .. } if *id == conj_id))));
        assert_eq!(action_flows[0].flow.r#match.get(&MatchField::ConjId), Some(&MatchValue::U32(conj_id)));
    }

    #[test]
    fn scenario4_chassis_resident_disabling_records_ref_and_emits_nothing() {
        let symtab = Symtab::default();
        let tables = TableMap::default();
        let ports = NoPorts;
        let ha = NoHaGroups;
        let port_bindings = FxHashMap::default();
        let addr_sets = AddressSetMap::default();
        let port_groups = PortGroupMap::default();
        let local_lports = HashSet::default();
        let env = fixture(&symtab, &tables, &ports, &ha, &port_bindings, &addr_sets, &port_groups, &local_lports);

        let dp = router_dp(1);
        let flow = lf("is_chassis_resident(\"p1\")", "drop;", 0, 10, dp.id);

        let mut ref_tracker = RefTracker::new();
        let mut conj_alloc = ConjIdAllocator::new();
        let mut meters = MeterTable::new(64);
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        let mut cache = FlowCache::new(1024 * 1024);

        let outcome = compile_flow(&flow, &dp, &env, &mut ref_tracker, &mut conj_alloc, &mut meters, &mut limiter, &mut cache, true);
        let FlowOutcome::Compiled(flows) = outcome else { panic!("expected compiled output") };
        assert!(flows.is_empty());
        assert!(ref_tracker.is_referenced(RefType::PortBinding, "p1"));
    }

    #[test]
    fn second_compile_of_an_unchanged_single_dp_flow_hits_the_matches_cache() {
        let symtab = Symtab::default();
        let tables = TableMap::default();
        let ports = NoPorts;
        let ha = NoHaGroups;
        let port_bindings = FxHashMap::default();
        let addr_sets = AddressSetMap::default();
        let port_groups = PortGroupMap::default();
        let local_lports = HashSet::default();
        let env = fixture(&symtab, &tables, &ports, &ha, &port_bindings, &addr_sets, &port_groups, &local_lports);

        let dp = router_dp(7);
        let flow = lf("ip4.dst==10.0.0.1", "next;", 3, 50, dp.id);

        let mut ref_tracker = RefTracker::new();
        let mut conj_alloc = ConjIdAllocator::new();
        let mut meters = MeterTable::new(64);
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        let mut cache = FlowCache::new(1024 * 1024);

        let first = compile_flow(&flow, &dp, &env, &mut ref_tracker, &mut conj_alloc, &mut meters, &mut limiter, &mut cache, true);
        assert!(matches!(first, FlowOutcome::Compiled(_)));
        assert!(matches!(cache.peek(flow.id), Some(CacheEntry::Matches { .. })));
        assert_eq!(cache.stats().misses, 1);

        let second = compile_flow(&flow, &dp, &env, &mut ref_tracker, &mut conj_alloc, &mut meters, &mut limiter, &mut cache, true);
        let FlowOutcome::Compiled(flows) = second else { panic!("expected compiled output") };
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].flow.r#match.get(&MatchField::Ip4Dst), Some(&MatchValue::Ipv4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(cache.stats().hits, 1);
    }
}
