//! The single-threaded engine (§5): owns every shared resource named
//! there (desired-flow sink excluded, since that's handed in per call)
//! and implements the full-recompute and incremental (§4.7) entry
//! points on top of `compile::compile_flow`.

use std::collections::HashSet;
use std::time::Duration;

use compact_str::CompactString;
use fxhash::FxHashMap;
use lpft_actions::PortLookup;
use lpft_conjid::ConjIdAllocator;
use lpft_core::{
    DatapathId, DatapathRef, DesiredFlow, FlowId, IpNet, LocalLport, OfAction, PortBinding,
    PortKind, RateLimiter, RefType,
};
use lpft_expr::{AddressSetMap, HaGroupResolver, PortGroupMap, Symtab};
use lpft_lb::HairpinIdPool;
use lpft_portsec::PortSecPort;
use lpft_reftracker::RefTracker;

use crate::compile::{compile_flow, CompileEnv, CompiledFlow, EmitKind, FlowCache, FlowOutcome};
use crate::config::EngineConfig;
use crate::db::{FlowSink, SbDatabase};

/// Resolves logical port names against whatever port bindings the
/// current tick's `SbDatabase` snapshot reports (§4.3 callback #1).
struct DbPortLookup<'a> {
    by_name: &'a FxHashMap<CompactString, PortBinding>,
}

impl<'a> PortLookup for DbPortLookup<'a> {
    fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|p| p.tag)
    }
}

/// A fake address-set value used by the delta path's "additions" branch
/// (§4.7): distinguishable from any real host address by construction,
/// never equal to `new`'s members in practice.
const DUMMY_PAD: IpNet = IpNet::V4(std::net::Ipv4Addr::new(0, 0, 0, 0), 32);

pub struct Engine<H: HaGroupResolver> {
    config: EngineConfig,
    symtab: Symtab,
    ha_groups: H,
    ref_tracker: RefTracker,
    conj_alloc: ConjIdAllocator,
    cache: FlowCache,
    hairpin_pool: HairpinIdPool,
    meters: lpft_actions::MeterTable,
    limiter: RateLimiter,
    processed: HashSet<FlowId>,
    stats: EngineStats,
}

/// Monotonic counters surfaced alongside structured log lines (§10.1).
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub recomputes: u64,
    pub incremental_ticks: u64,
    pub incremental_fallbacks: u64,
}

impl<H: HaGroupResolver> Engine<H> {
    pub fn new(config: EngineConfig, ha_groups: H) -> Self {
        let cache_budget = config.cache_byte_budget;
        Self {
            config,
            symtab: Symtab::default(),
            ha_groups,
            ref_tracker: RefTracker::new(),
            conj_alloc: ConjIdAllocator::new(),
            cache: FlowCache::new(cache_budget),
            hairpin_pool: HairpinIdPool::new(),
            meters: lpft_actions::MeterTable::new(u32::from(u16::MAX)),
            limiter: RateLimiter::new(5, Duration::from_secs(1)),
            processed: HashSet::default(),
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    fn local_lports(&self, db: &dyn SbDatabase) -> HashSet<LocalLport> {
        db.port_bindings()
            .filter(|p| self.is_local(p))
            .map(|p| LocalLport { datapath: p.datapath, port_tag: p.tag })
            .collect()
    }

    fn port_bindings_by_name(&self, db: &dyn SbDatabase) -> FxHashMap<CompactString, PortBinding> {
        db.port_bindings().map(|p| (p.name.clone(), p.clone())).collect()
    }

    fn is_local(&self, port: &PortBinding) -> bool {
        match &port.kind {
            PortKind::Plain { chassis } => chassis.as_deref() == Some(self.config.chassis.as_str()),
            PortKind::ChassisRedirect { ha_group } => {
                self.ha_groups.active_chassis(ha_group) == Some(self.config.chassis.as_str())
            }
        }
    }

    /// Resolves every `$name` a match string references against the
    /// south-bound view, splitting the results into the address-set and
    /// port-group maps `compile_flow` needs already populated (§4.3 step
    /// 1/3). Unparseable match strings resolve to empty maps; the real
    /// parse inside `compile_flow` reports the error through the normal
    /// skip path.
    fn resolve_refs(&self, db: &dyn SbDatabase, match_str: &str) -> (AddressSetMap, PortGroupMap) {
        let mut addr_sets = AddressSetMap::default();
        let mut port_groups = PortGroupMap::default();
        let Ok(names) = lpft_expr::referenced_set_names(match_str) else {
            return (addr_sets, port_groups);
        };
        for name in names {
            if let Some(members) = db.address_set(&name) {
                addr_sets.insert(name, members.to_vec());
            } else if let Some(members) = db.port_group(&name) {
                port_groups.insert(name, members.to_vec());
            }
        }
        (addr_sets, port_groups)
    }

    fn route(&self, flow: DesiredFlow, sink: &mut dyn FlowSink) {
        if flow.actions.iter().any(|a| matches!(a, OfAction::Conjunction { .. })) {
            sink.add_or_append_flow(flow);
        } else {
            sink.add_flow(flow);
        }
    }

    fn emit(&self, outcome: FlowOutcome, sink: &mut dyn FlowSink) {
        let FlowOutcome::Compiled(flows) = outcome else { return };
        for CompiledFlow { flow, emit } in flows {
            match emit {
                EmitKind::Add => sink.add_flow(flow),
                EmitKind::AddMetered(meter) => sink.add_flow_metered(flow, meter),
                EmitKind::AddOrAppend => sink.add_or_append_flow(flow),
            }
        }
    }

    /// Compiles `id` against every local member of its datapath or
    /// datapath group and hands the results to `sink`. A no-op (neither
    /// skip nor emit) if the row is gone or names no locally present
    /// datapath.
    fn recompile_flow(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink, id: FlowId) {
        let Some(lf) = db.logical_flow(id) else { return };
        let lf = lf.clone();
        let member_dps: Vec<DatapathId> = match lf.datapath {
            DatapathRef::Single(dp) => vec![dp],
            DatapathRef::Group(g) => db.dp_group_members(g).to_vec(),
        };

        let port_bindings = self.port_bindings_by_name(db);
        let local_lports = self.local_lports(db);
        let ports = DbPortLookup { by_name: &port_bindings };
        let (addr_sets, port_groups) = self.resolve_refs(db, &lf.r#match);

        for dp_id in member_dps {
            let Some(dp) = db.local_datapath(dp_id) else { continue };
            let env = CompileEnv {
                symtab: &self.symtab,
                tables: &self.config.tables,
                ports: &ports,
                ha_groups: &self.ha_groups,
                port_bindings: &port_bindings,
                addr_sets: &addr_sets,
                port_groups: &port_groups,
                local_lports: &local_lports,
                chassis: self.config.chassis.as_str(),
            };
            let outcome = compile_flow(
                &lf,
                dp,
                &env,
                &mut self.ref_tracker,
                &mut self.conj_alloc,
                &mut self.meters,
                &mut self.limiter,
                &mut self.cache,
                true,
            );
            self.emit(outcome, sink);
        }
    }

    fn regenerate_port_security(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink, port: &PortBinding) {
        let entries = db.port_security(&port.name);
        if entries.is_empty() {
            return;
        }
        let p = PortSecPort { inport_tag: port.tag, outport_tag: port.tag };
        let owner = port.id;
        for flow in lpft_portsec::generate(owner, p, entries, &self.config.tables) {
            self.route(flow, sink);
        }
    }

    fn emit_lb(&mut self, sink: &mut dyn FlowSink, lb: &lpft_lb::LoadBalancer) {
        let legacy_compat = self.config.lb_legacy_ct_label_compat;
        for flow in lpft_lb::generate(lb, &self.config.tables, &mut self.hairpin_pool, legacy_compat) {
            self.route(flow, sink);
        }
    }

    /// Removes every desired flow owned by any id in `ids` (§4.7 "flood
    /// remove protocol"). Returns the subset that actually had output.
    fn flood_remove(&self, sink: &mut dyn FlowSink, ids: &HashSet<FlowId>) -> HashSet<FlowId> {
        if ids.is_empty() {
            return HashSet::default();
        }
        sink.flood_remove_flows(ids)
    }

    fn forget(&mut self, id: FlowId) {
        self.ref_tracker.remove_all_for_flow(id);
        self.conj_alloc.free_for_flow(id);
        self.cache.invalidate(id);
        self.processed.remove(&id);
    }

    /// (a) + (b) of §5's tick description, run as one full pass: every
    /// logical flow, every load balancer, every locally bound port.
    pub fn recompute(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink) {
        self.processed.clear();
        let ids: Vec<FlowId> = db.logical_flows().map(|lf| lf.id).collect();
        for id in ids {
            if self.processed.contains(&id) {
                continue;
            }
            self.recompile_flow(db, sink, id);
            self.processed.insert(id);
        }

        let lbs: Vec<_> = db.load_balancers().cloned().collect();
        for lb in &lbs {
            self.emit_lb(sink, lb);
        }

        let ports: Vec<_> = db.port_bindings().cloned().collect();
        for port in &ports {
            if self.is_local(port) {
                self.regenerate_port_security(db, sink, port);
            }
        }

        self.stats.recomputes += 1;
    }

    /// §4.7 "Changed logical flows": flood-remove every tracked id, then
    /// recompile the ones whose row survived.
    pub fn handle_changed_logical_flows(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink) {
        let tracked: Vec<(FlowId, crate::db::RowChange)> = db.tracked_logical_flows().collect();
        if tracked.is_empty() {
            return;
        }
        let ids: HashSet<FlowId> = tracked.iter().map(|(id, _)| *id).collect();
        self.flood_remove(sink, &ids);

        for (id, _) in tracked {
            self.forget(id);
            if db.logical_flow(id).is_some() {
                self.recompile_flow(db, sink, id);
                self.processed.insert(id);
            }
        }
        self.stats.incremental_ticks += 1;
    }

    /// §4.7 "Changed symbol": flood-remove and recompile every referrer
    /// not already processed this tick. `PortBinding` changes additionally
    /// replay port-security for the port if it's locally resident.
    pub fn handle_changed_symbol(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink, ty: RefType, name: &str) {
        let referrers: Vec<FlowId> = self.ref_tracker.lookup_by_symbol(ty, name).map(|(f, _)| f).collect();
        for id in referrers {
            if self.processed.contains(&id) {
                continue;
            }
            let set: HashSet<FlowId> = std::iter::once(id).collect();
            self.flood_remove(sink, &set);
            self.forget(id);
            self.recompile_flow(db, sink, id);
            self.processed.insert(id);
        }

        if ty == RefType::PortBinding {
            if let Some(port) = db.port_binding_by_name(name) {
                if self.is_local(port) {
                    let port = port.clone();
                    self.regenerate_port_security(db, sink, &port);
                }
            }
        }
        self.stats.incremental_ticks += 1;
    }

    /// §4.7 "Port residency change": a `PortBinding` symbol change plus
    /// the port-security replay `handle_changed_symbol` already does.
    pub fn handle_port_residency_change(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink, port_name: &str) {
        self.handle_changed_symbol(db, sink, RefType::PortBinding, port_name);
    }

    /// §4.7 "Datapath activation": every flow singly bound to `dp`, plus
    /// every flow whose group contains it, compiled exactly once.
    pub fn handle_datapath_activated(&mut self, db: &dyn SbDatabase, sink: &mut dyn FlowSink, dp: DatapathId) {
        let ids: Vec<FlowId> = db
            .logical_flows()
            .filter(|lf| match lf.datapath {
                DatapathRef::Single(d) => d == dp,
                DatapathRef::Group(g) => db.dp_group_members(g).contains(&dp),
            })
            .map(|lf| lf.id)
            .collect();
        for id in ids {
            if self.processed.contains(&id) {
                continue;
            }
            self.recompile_flow(db, sink, id);
            self.processed.insert(id);
        }
        self.stats.incremental_ticks += 1;
    }

    /// §4.7 "Address-set delta": attempts the in-place diff path,
    /// returns `false` if any structural assumption failed so the caller
    /// can fall back to `handle_changed_symbol`.
    pub fn handle_address_set_delta(
        &mut self,
        db: &dyn SbDatabase,
        sink: &mut dyn FlowSink,
        name: &str,
        old: &[IpNet],
        new: &[IpNet],
    ) -> bool {
        let old_size = old.len();
        let new_size = new.len();
        let added: Vec<IpNet> = new.iter().filter(|ip| !old.contains(ip)).copied().collect();
        let deleted: Vec<IpNet> = old.iter().filter(|ip| !new.contains(ip)).copied().collect();

        if !(old_size > 1 && new_size > 1 && added.len() + deleted.len() < new_size) {
            return false;
        }

        let referrers: Vec<(FlowId, u32)> = self.ref_tracker.lookup_by_symbol(RefType::AddressSet, name).collect();
        if referrers.is_empty() {
            return true;
        }

        for ip in &deleted {
            for (flow, ref_count) in &referrers {
                let tag = lpft_core::AsTag { name: name.into(), ip: *ip };
                if !sink.remove_flows_for_as_ip(*flow, &tag, *ref_count) {
                    self.stats.incremental_fallbacks += 1;
                    self.forget(*flow);
                    self.recompile_flow(db, sink, *flow);
                    return false;
                }
            }
        }

        if added.is_empty() {
            self.stats.incremental_ticks += 1;
            return true;
        }

        let mut substitute: Vec<IpNet> = added.clone();
        if substitute.len() == 1 {
            substitute.push(DUMMY_PAD);
        }

        let port_bindings = self.port_bindings_by_name(db);
        let local_lports = self.local_lports(db);
        let ports = DbPortLookup { by_name: &port_bindings };

        for (flow_id, ref_count) in &referrers {
            let Some(lf) = db.logical_flow(*flow_id) else { continue };
            let lf = lf.clone();
            let (mut addr_sets, port_groups) = self.resolve_refs(db, &lf.r#match);
            addr_sets.insert(name.into(), substitute.clone());
            let member_dps: Vec<DatapathId> = match lf.datapath {
                DatapathRef::Single(dp) => vec![dp],
                DatapathRef::Group(g) => db.dp_group_members(g).to_vec(),
            };

            let mut retained = Vec::new();
            let mut structural_ok = true;
            for dp_id in &member_dps {
                let Some(dp) = db.local_datapath(*dp_id) else { continue };
                let env = CompileEnv {
                    symtab: &self.symtab,
                    tables: &self.config.tables,
                    ports: &ports,
                    ha_groups: &self.ha_groups,
                    port_bindings: &port_bindings,
                    addr_sets: &addr_sets,
                    port_groups: &port_groups,
                    local_lports: &local_lports,
                    chassis: self.config.chassis.as_str(),
                };
                // This probe compiles against a synthesized single-member
                // substitute set, not the database's real address set —
                // its result must never be written into the shared cache.
                let outcome = compile_flow(
                    &lf,
                    dp,
                    &env,
                    &mut self.ref_tracker,
                    &mut self.conj_alloc,
                    &mut self.meters,
                    &mut self.limiter,
                    &mut self.cache,
                    false,
                );
                let FlowOutcome::Compiled(flows) = outcome else {
                    structural_ok = false;
                    break;
                };
                for cf in flows {
                    match &cf.flow.as_tag {
                        Some(tag) if tag.name == name && tag.ip != DUMMY_PAD => retained.push(cf),
                        Some(_) | None => {}
                    }
                }
            }

            if !structural_ok || retained.len() != (*ref_count as usize) * added.len() {
                self.stats.incremental_fallbacks += 1;
                self.forget(*flow_id);
                self.recompile_flow(db, sink, *flow_id);
                continue;
            }

            for cf in retained {
                self.emit(FlowOutcome::Compiled(vec![cf]), sink);
            }
        }

        self.stats.incremental_ticks += 1;
        true
    }
}
