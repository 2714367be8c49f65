//! Compilation units and the pending-unit queue
//!
//! A unit is the engine's bookkeeping record for one body's JIT lifecycle:
//! created at enqueue, carried through the worker, and retained while its
//! shared object stays loaded. Exactly one unit ever exists per body.
//!
//! The queue hands out the unit whose body has the largest observed call
//! count. Dequeue scans the insertion-ordered list; the list stays small
//! because units either compile promptly or are unloaded, so the scan is
//! cheaper than maintaining a heap.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::build::loader::SharedObject;
use crate::vm::IseqBody;

/// Bookkeeping record for one body's JIT lifecycle
pub struct JitUnit {
    /// Monotonically assigned id; also names the unit's scratch files and
    /// entry symbol
    pub id: u64,
    /// The body, cleared when the host collects it before the worker gets
    /// to this unit
    pub body: Option<Arc<IseqBody>>,
    /// Loaded shared object, present once compilation succeeded
    pub handle: Option<SharedObject>,
}

impl JitUnit {
    /// A fresh unit tracking `body`
    pub fn new(id: u64, body: Arc<IseqBody>) -> JitUnit {
        JitUnit { id, body: Some(body), handle: None }
    }

    /// Entry symbol exposed by this unit's shared object
    pub fn funcname(&self) -> String {
        format!("_jit{}", self.id)
    }

    fn calls(&self) -> usize {
        self.body.as_ref().map_or(0, |b| b.total_calls())
    }
}

/// Pending units in insertion order
#[derive(Default)]
pub struct UnitQueue {
    units: FxHashMap<u64, JitUnit>,
    order: Vec<u64>,
}

impl UnitQueue {
    /// An empty queue
    pub fn new() -> UnitQueue {
        UnitQueue::default()
    }

    /// Append a unit at the tail
    pub fn enqueue(&mut self, unit: JitUnit) {
        self.order.push(unit.id);
        self.units.insert(unit.id, unit);
    }

    /// Remove and return the unit whose body has the largest observed call
    /// count, ties broken by insertion order. Units whose body was collected
    /// are reaped along the way.
    pub fn dequeue_best(&mut self) -> Option<JitUnit> {
        let mut best: Option<(usize, u64)> = None; // (calls, id), first insertion wins ties
        self.order.retain(|&id| match self.units.get(&id) {
            Some(unit) if unit.body.is_some() => {
                let calls = unit.calls();
                if best.map_or(true, |(b, _)| calls > b) {
                    best = Some((calls, id));
                }
                true
            }
            Some(_) => {
                self.units.remove(&id);
                false
            }
            None => false,
        });

        let (_, id) = best?;
        self.order.retain(|&o| o != id);
        self.units.remove(&id)
    }

    /// Unlink a specific unit
    pub fn remove(&mut self, id: u64) -> Option<JitUnit> {
        let unit = self.units.remove(&id)?;
        self.order.retain(|&o| o != id);
        Some(unit)
    }

    /// Borrow a unit by id
    pub fn get_mut(&mut self, id: u64) -> Option<&mut JitUnit> {
        self.units.get_mut(&id)
    }

    /// Number of queued units (including ones with a collected body)
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Take every queued unit, in insertion order
    pub fn drain(&mut self) -> Vec<JitUnit> {
        let order = std::mem::take(&mut self.order);
        order.into_iter().filter_map(|id| self.units.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{IseqBuilder, OpCode};

    fn body_with_calls(label: &str, calls: usize) -> Arc<IseqBody> {
        let mut b = IseqBuilder::new(label, 1);
        b.insn(OpCode::PutNil, &[]);
        b.insn(OpCode::Leave, &[]);
        let body = Arc::new(b.build());
        for _ in 0..calls {
            body.record_call();
        }
        body
    }

    #[test]
    fn test_dequeue_picks_hottest() {
        let mut q = UnitQueue::new();
        q.enqueue(JitUnit::new(1, body_with_calls("cold", 2)));
        q.enqueue(JitUnit::new(2, body_with_calls("hot", 50)));
        q.enqueue(JitUnit::new(3, body_with_calls("warm", 10)));

        assert_eq!(q.dequeue_best().unwrap().id, 2);
        assert_eq!(q.dequeue_best().unwrap().id, 3);
        assert_eq!(q.dequeue_best().unwrap().id, 1);
        assert!(q.dequeue_best().is_none());
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut q = UnitQueue::new();
        q.enqueue(JitUnit::new(10, body_with_calls("a", 5)));
        q.enqueue(JitUnit::new(11, body_with_calls("b", 5)));
        assert_eq!(q.dequeue_best().unwrap().id, 10);
        assert_eq!(q.dequeue_best().unwrap().id, 11);
    }

    #[test]
    fn test_collected_bodies_are_reaped() {
        let mut q = UnitQueue::new();
        q.enqueue(JitUnit::new(1, body_with_calls("gone", 100)));
        q.enqueue(JitUnit::new(2, body_with_calls("alive", 1)));

        q.get_mut(1).unwrap().body = None;

        let unit = q.dequeue_best().unwrap();
        assert_eq!(unit.id, 2);
        // The collected unit was discarded during the scan
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_unlinks() {
        let mut q = UnitQueue::new();
        q.enqueue(JitUnit::new(1, body_with_calls("a", 1)));
        q.enqueue(JitUnit::new(2, body_with_calls("b", 2)));

        assert!(q.remove(1).is_some());
        assert!(q.remove(1).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue_best().unwrap().id, 2);
    }

    #[test]
    fn test_funcname_is_id_based() {
        let unit = JitUnit::new(42, body_with_calls("f", 0));
        assert_eq!(unit.funcname(), "_jit42");
    }
}
