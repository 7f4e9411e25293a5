//! Lflow-Cache (§3 `CacheEntry`, §5 eviction policy): per-flow memoization
//! of compilation artifacts, generic over the two payload shapes the rest
//! of the crate produces (the pre-normalize expression AST from
//! `lpft-expr`, and the post-normalize matches also from `lpft-expr`) so
//! this crate stays decoupled from the expression grammar itself.
//!
//! Flows bound to a single datapath (the common case) can cache the fully
//! normalized `Matches` state; flows bound to a datapath *group* cache
//! only the pre-normalize `Expr`, because each member datapath gets its
//! own conjunction-id range and re-deriving matches per member is
//! unavoidable anyway (an Open Question resolution, see DESIGN.md).

use fxhash::FxHashMap;
use lpft_conjid::ConjIdAllocator;
use lpft_core::{ConjId, DatapathId, FlowId};

#[derive(Debug, Clone)]
pub enum CacheEntry<Ast, Norm> {
    None,
    Expr {
        ast: Ast,
        size_bytes: usize,
    },
    Matches {
        norm: Norm,
        dp: DatapathId,
        conj_id_offset: Option<ConjId>,
        n_conjs: u32,
        size_bytes: usize,
    },
}

impl<Ast, Norm> CacheEntry<Ast, Norm> {
    fn size_bytes(&self) -> usize {
        match self {
            CacheEntry::None => 0,
            CacheEntry::Expr { size_bytes, .. } => *size_bytes,
            CacheEntry::Matches { size_bytes, .. } => *size_bytes,
        }
    }

    fn rank(&self) -> u8 {
        // Eviction prefers discarding `Expr` over `Matches` (§5): rank 0
        // entries go first.
        match self {
            CacheEntry::None => 0,
            CacheEntry::Expr { .. } => 0,
            CacheEntry::Matches { .. } => 1,
        }
    }
}

struct Slot<Ast, Norm> {
    entry: CacheEntry<Ast, Norm>,
    age: u64,
}

#[derive(Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct LflowCache<Ast, Norm> {
    slots: FxHashMap<FlowId, Slot<Ast, Norm>>,
    budget_bytes: usize,
    used_bytes: usize,
    clock: u64,
    stats: CacheStats,
}

impl<Ast, Norm> LflowCache<Ast, Norm> {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            slots: FxHashMap::default(),
            budget_bytes,
            used_bytes: 0,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// The unified accessor (§9 "keep the three-state cache transparent
    /// to callers"): returns `None` the variant if there is nothing
    /// cached, counting a hit/miss as appropriate.
    pub fn get(&mut self, flow: FlowId) -> &CacheEntry<Ast, Norm> {
        match self.slots.get(&flow) {
            Some(slot) if !matches!(slot.entry, CacheEntry::None) => {
                self.stats.hits += 1;
            }
            _ => {
                self.stats.misses += 1;
            }
        }
        self.slots
            .get(&flow)
            .map(|s| &s.entry)
            .unwrap_or(&CacheEntry::None)
    }

    pub fn peek(&self, flow: FlowId) -> Option<&CacheEntry<Ast, Norm>> {
        self.slots.get(&flow).map(|s| &s.entry)
    }

    pub fn insert_expr(&mut self, flow: FlowId, ast: Ast, size_bytes: usize) {
        self.insert(flow, CacheEntry::Expr { ast, size_bytes });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_matches(
        &mut self,
        flow: FlowId,
        dp: DatapathId,
        norm: Norm,
        conj_id_offset: Option<ConjId>,
        n_conjs: u32,
        size_bytes: usize,
    ) {
        self.insert(
            flow,
            CacheEntry::Matches { norm, dp, conj_id_offset, n_conjs, size_bytes },
        );
    }

    fn insert(&mut self, flow: FlowId, entry: CacheEntry<Ast, Norm>) {
        self.invalidate(flow);
        self.used_bytes += entry.size_bytes();
        self.clock += 1;
        self.slots.insert(flow, Slot { entry, age: self.clock });
        self.evict_if_over_budget();
    }

    /// Demotes the flow's entry to `None` (§3 lifecycle / §7 cache
    /// inconsistency).
    pub fn invalidate(&mut self, flow: FlowId) {
        if let Some(slot) = self.slots.remove(&flow) {
            self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size_bytes());
        }
    }

    /// §3: "The stored offset and count must be re-validated against the
    /// conj-id allocator before use; if the range has been reclaimed the
    /// entry is demoted to `None`." Returns `true` if the entry (if any)
    /// survived validation.
    pub fn validate_matches(&mut self, flow: FlowId, allocator: &ConjIdAllocator) -> bool {
        let stale = match self.slots.get(&flow) {
            Some(Slot { entry: CacheEntry::Matches { dp, conj_id_offset: Some(first), n_conjs, .. }, .. }) => {
                allocator.find(flow, *dp) != Some(*first) && *n_conjs > 0
            }
            _ => false,
        };
        if stale {
            self.invalidate(flow);
            false
        } else {
            true
        }
    }

    fn evict_if_over_budget(&mut self) {
        while self.used_bytes > self.budget_bytes {
            let victim = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| (slot.entry.rank(), slot.age))
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    self.invalidate(id);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    type TestCache = LflowCache<u32, u32>;

    #[test]
    fn miss_then_hit() {
        let mut c: TestCache = LflowCache::new(1024);
        let f = Uuid::new_v4();
        assert!(matches!(c.get(f), CacheEntry::None));
        c.insert_expr(f, 7, 8);
        assert!(matches!(c.get(f), CacheEntry::Expr { ast: 7, .. }));
        assert_eq!(c.stats().hits, 1);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn eviction_prefers_expr_over_matches() {
        let mut c: TestCache = LflowCache::new(10);
        let (f1, f2, dp) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        c.insert_matches(f1, dp, 99, None, 0, 6);
        c.insert_expr(f2, 1, 6);
        // budget is 10, both entries totalling 12 bytes triggers eviction
        // of the Expr entry (f2) before the Matches entry (f1, rank 1).
        assert!(c.peek(f2).is_none());
        assert!(matches!(c.peek(f1), Some(CacheEntry::Matches { .. })));
    }

    #[test]
    fn validate_matches_demotes_stale_entry() {
        let mut c: TestCache = LflowCache::new(1024);
        let mut alloc = ConjIdAllocator::new();
        let (f, dp) = (Uuid::new_v4(), Uuid::new_v4());
        let first = alloc.alloc(f, dp, 2);
        c.insert_matches(f, dp, 42, Some(first), 2, 4);
        assert!(c.validate_matches(f, &alloc));
        alloc.free_for_flow(f);
        assert!(!c.validate_matches(f, &alloc));
        assert!(c.peek(f).is_none());
    }
}
