//! Controller-meter name interning (§4.4): a bounded "extend-table"
//! abstraction — a finite associative allocator keyed by `(name,
//! flow_id)` — so repeated compiles of the same flow get back the same
//! meter id instead of leaking a fresh one every tick.

use fxhash::FxHashMap;
use lpft_core::FlowId;

pub struct MeterTable {
    capacity: u32,
    next: u32,
    ids: FxHashMap<(compact_str::CompactString, FlowId), u32>,
}

impl MeterTable {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, next: 1, ids: FxHashMap::default() }
    }

    /// Returns the meter id for `(name, flow)`, allocating one if this is
    /// the first time this pair has been seen. Returns `None` (the "no
    /// meter" sentinel, §7) once the table is full; the caller is
    /// expected to log a rate-limited warning and proceed without a
    /// meter.
    pub fn intern(&mut self, name: &str, flow: FlowId) -> Option<u32> {
        let key = (compact_str::CompactString::from(name), flow);
        if let Some(&id) = self.ids.get(&key) {
            return Some(id);
        }
        if self.next > self.capacity {
            return None;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(key, id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn same_key_returns_same_id() {
        let mut t = MeterTable::new(4);
        let f = Uuid::new_v4();
        let id1 = t.intern("m1", f).unwrap();
        let id2 = t.intern("m1", f).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn exhaustion_yields_no_meter_sentinel() {
        let mut t = MeterTable::new(1);
        let (f1, f2) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(t.intern("a", f1).is_some());
        assert!(t.intern("b", f2).is_none());
    }
}
