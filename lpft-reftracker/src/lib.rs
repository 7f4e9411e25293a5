//! Reference Tracker (§4.1): a bipartite graph between logical flows and
//! the external symbols (address sets, port groups, port bindings,
//! multicast groups) they reference during compilation. Held as two
//! independently keyed hash maps with each edge stored in both, so lookups
//! in either direction and deletion are both amortized O(1) (§9 "Graph of
//! cross-references").

use compact_str::CompactString;
use fxhash::FxHashMap;
use lpft_core::{FlowId, RefType};

pub type Symbol = (RefType, CompactString);

#[derive(Debug, Default)]
pub struct RefTracker {
    by_symbol: FxHashMap<Symbol, FxHashMap<FlowId, u32>>,
    by_flow: FxHashMap<FlowId, FxHashMap<Symbol, u32>>,
}

impl RefTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: if `(type, name, flow_id)` already exists, this is a
    /// no-op — `ref_count` is not bumped on re-add, it is set wholesale by
    /// the caller from the parser's computed count (§4.1).
    pub fn add(&mut self, ty: RefType, name: impl Into<CompactString>, flow: FlowId, ref_count: u32) {
        let name = name.into();
        let sym = (ty, name);
        let by_flow_entry = self.by_flow.entry(flow).or_default();
        if by_flow_entry.contains_key(&sym) {
            return;
        }
        by_flow_entry.insert(sym.clone(), ref_count);
        self.by_symbol.entry(sym).or_default().insert(flow, ref_count);
    }

    /// Removes every reference originating at `flow`, garbage-collecting
    /// any symbol whose referrer set becomes empty (§4.1).
    pub fn remove_all_for_flow(&mut self, flow: FlowId) {
        let Some(syms) = self.by_flow.remove(&flow) else { return };
        for (sym, _) in syms {
            if let Some(referrers) = self.by_symbol.get_mut(&sym) {
                referrers.remove(&flow);
                if referrers.is_empty() {
                    self.by_symbol.remove(&sym);
                }
            }
        }
    }

    pub fn lookup_by_symbol<'a>(
        &'a self,
        ty: RefType,
        name: &str,
    ) -> impl Iterator<Item = (FlowId, u32)> + 'a {
        let key = self.by_symbol.keys().find(|(t, n)| *t == ty && n.as_str() == name);
        key.into_iter()
            .flat_map(move |k| self.by_symbol.get(k).into_iter().flatten())
            .map(|(f, c)| (*f, *c))
    }

    pub fn is_referenced(&self, ty: RefType, name: &str) -> bool {
        self.lookup_by_symbol(ty, name).next().is_some()
    }

    /// Every `(flow, symbol)` edge as seen from `by_flow`, for tests and
    /// for engine-level P3 checks.
    pub fn edges(&self) -> Vec<(FlowId, Symbol, u32)> {
        self.by_flow
            .iter()
            .flat_map(|(f, syms)| syms.iter().map(move |(s, c)| (*f, s.clone(), *c)))
            .collect()
    }

    /// P3: ref symmetry — `flow ∈ by_symbol[sym] ⇔ sym ∈ by_flow[flow]`.
    pub fn check_symmetry(&self) -> bool {
        for (sym, referrers) in &self.by_symbol {
            for flow in referrers.keys() {
                match self.by_flow.get(flow) {
                    Some(syms) if syms.contains_key(sym) => {}
                    _ => return false,
                }
            }
        }
        for (flow, syms) in &self.by_flow {
            for sym in syms.keys() {
                match self.by_symbol.get(sym) {
                    Some(referrers) if referrers.contains_key(flow) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    #[test]
    fn add_is_idempotent_on_ref_count() {
        let mut t = RefTracker::new();
        let f = Uuid::new_v4();
        t.add(RefType::AddressSet, "s", f, 3);
        t.add(RefType::AddressSet, "s", f, 99);
        let (_, c) = t.lookup_by_symbol(RefType::AddressSet, "s").next().unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn remove_all_purges_empty_symbol() {
        let mut t = RefTracker::new();
        let f = Uuid::new_v4();
        t.add(RefType::PortGroup, "pg1", f, 1);
        assert!(t.is_referenced(RefType::PortGroup, "pg1"));
        t.remove_all_for_flow(f);
        assert!(!t.is_referenced(RefType::PortGroup, "pg1"));
        assert!(t.check_symmetry());
    }

    #[test]
    fn multiple_flows_share_a_symbol() {
        let mut t = RefTracker::new();
        let (f1, f2) = (Uuid::new_v4(), Uuid::new_v4());
        t.add(RefType::AddressSet, "s", f1, 1);
        t.add(RefType::AddressSet, "s", f2, 2);
        t.remove_all_for_flow(f1);
        assert!(t.is_referenced(RefType::AddressSet, "s"));
        t.remove_all_for_flow(f2);
        assert!(!t.is_referenced(RefType::AddressSet, "s"));
    }

    fn ref_type() -> impl Strategy<Value = RefType> {
        prop_oneof![
            Just(RefType::AddressSet),
            Just(RefType::PortGroup),
            Just(RefType::PortBinding),
            Just(RefType::McastGroup),
        ]
    }

    proptest! {
        #[test]
        fn symmetry_holds_under_random_add_remove(
            ops in prop::collection::vec(
                (ref_type(), "[a-c]", 0u32..16u32, prop::bool::ANY),
                0..200,
            )
        ) {
            let mut t = RefTracker::new();
            let flows: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
            for (i, (ty, name, count, remove)) in ops.into_iter().enumerate() {
                let flow = flows[i % flows.len()];
                if remove {
                    t.remove_all_for_flow(flow);
                } else {
                    t.add(ty, name, flow, count);
                }
                prop_assert!(t.check_symmetry());
            }
        }
    }
}
