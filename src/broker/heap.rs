//! Priority ordering for the broker's per-scheduler-type ready heaps.
//!
//! Orders by `(Priority desc, CreateIndex asc)` (spec.md §4.D), so
//! [`std::collections::BinaryHeap`] (a max-heap) pops the highest-priority,
//! earliest-created evaluation first.

use std::cmp::Ordering;

use crate::eval::WrappedEvaluation;

#[derive(Debug)]
pub struct HeapEntry(pub WrappedEvaluation);

impl HeapEntry {
    fn sort_key(&self) -> (i64, std::cmp::Reverse<u64>) {
        (self.0.eval.priority, std::cmp::Reverse(self.0.eval.create_index))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn eval(priority: i64, create_index: u64) -> WrappedEvaluation {
        let mut e = crate::test_support::sample_eval("ns", "job");
        e.priority = priority;
        e.create_index = create_index;
        WrappedEvaluation::new(e)
    }

    #[test]
    fn priority_monotonicity() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry(eval(10, 1)));
        heap.push(HeapEntry(eval(50, 2)));
        heap.push(HeapEntry(eval(30, 3)));

        let first = heap.pop().unwrap().0.eval.priority;
        let second = heap.pop().unwrap().0.eval.priority;
        assert_eq!(first, 50);
        assert_eq!(second, 30);
        assert!(second <= first);
    }

    #[test]
    fn fifo_at_fixed_priority() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry(eval(50, 3)));
        heap.push(HeapEntry(eval(50, 1)));
        heap.push(HeapEntry(eval(50, 2)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.0.eval.create_index))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
