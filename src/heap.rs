use std::collections::HashMap;
use std::hash::Hash;

/// Binary min-heap keyed by element identity.
///
/// Every element is tracked in a parallel `identity -> slot` map kept in sync
/// on each swap, so an element already queued can be removed or re-keyed in
/// `O(log n)` without scanning the heap.
#[derive(Debug)]
pub(crate) struct PriorityQueue<K, P> {
    nodes: Vec<(K, P)>,
    slots: HashMap<K, usize>,
    before: fn(&P, &P) -> bool,
}

impl<K, P> PriorityQueue<K, P>
where
    K: Copy + Eq + Hash,
    P: Ord,
{
    /// Smallest priority first.
    pub fn new() -> Self {
        Self::with_ordering(|a, b| a < b)
    }
}

impl<K, P> PriorityQueue<K, P>
where
    K: Copy + Eq + Hash,
{
    /// `before(a, b)` must return true when `a` should be popped before `b`.
    pub fn with_ordering(before: fn(&P, &P) -> bool) -> Self {
        Self {
            nodes: Vec::new(),
            slots: HashMap::new(),
            before,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn peek(&self) -> Option<(&K, &P)> {
        self.nodes.first().map(|(k, p)| (k, p))
    }

    /// Inserts `key`, or moves it to its new place if it is already queued.
    pub fn push(&mut self, key: K, priority: P) {
        if let Some(&index) = self.slots.get(&key) {
            self.nodes[index].1 = priority;
            self.reposition(index);
            return;
        }
        let index = self.nodes.len();
        self.nodes.push((key, priority));
        self.slots.insert(key, index);
        self.bubble_up(index);
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.nodes.is_empty() {
            return None;
        }
        Some(self.take(0))
    }

    pub fn remove(&mut self, key: &K) -> Option<P> {
        let index = *self.slots.get(key)?;
        Some(self.take(index).1)
    }

    fn take(&mut self, index: usize) -> (K, P) {
        let (key, priority) = self.nodes.swap_remove(index);
        self.slots.remove(&key);
        if index < self.nodes.len() {
            self.slots.insert(self.nodes[index].0, index);
            self.reposition(index);
        }
        (key, priority)
    }

    fn reposition(&mut self, index: usize) {
        if index > 0 && self.is_before(index, (index - 1) / 2) {
            self.bubble_up(index);
        } else {
            self.sink_down(index);
        }
    }

    fn bubble_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.is_before(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sink_down(&mut self, mut index: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.is_before(right, left) {
                right
            } else {
                left
            };
            if !self.is_before(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }

    fn is_before(&self, a: usize, b: usize) -> bool {
        (self.before)(&self.nodes[a].1, &self.nodes[b].1)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.nodes.swap(a, b);
        self.slots.insert(self.nodes[a].0, a);
        self.slots.insert(self.nodes[b].0, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_again_rekeys() {
        let mut heap = PriorityQueue::new();
        heap.push(1u32, 30);
        heap.push(2u32, 20);
        heap.push(3u32, 10);
        heap.push(1u32, 5);
        assert_eq!(heap.len(), 3);
        assert_eq!(heap.pop(), Some((1, 5)));
        heap.push(3u32, 40);
        assert_eq!(heap.pop(), Some((2, 20)));
        assert_eq!(heap.pop(), Some((3, 40)));
        assert_eq!(heap.pop(), None);
    }

    #[test]
    fn remove_non_minimum() {
        let mut heap = PriorityQueue::new();
        for (key, priority) in [(1u32, 1), (2, 7), (3, 3), (4, 9), (5, 2)] {
            heap.push(key, priority);
        }
        assert_eq!(heap.remove(&3), Some(3));
        assert_eq!(heap.remove(&3), None);
        assert!(!heap.contains(&3));
        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|(k, _)| k).collect();
        assert_eq!(order, vec![1, 5, 2, 4]);
    }

    #[test]
    fn custom_ordering() {
        let mut heap = PriorityQueue::with_ordering(|a: &u32, b: &u32| a > b);
        heap.push('a', 1);
        heap.push('b', 3);
        assert_eq!(heap.peek(), Some((&'b', &3)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u8, u16),
        Pop,
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..32, any::<u16>()).prop_map(|(k, p)| Op::Push(k, p)),
            Just(Op::Pop),
            (0u8..32).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn pops_follow_a_model(ops in proptest::collection::vec(op(), 0..200)) {
            let mut heap = PriorityQueue::new();
            let mut model: HashMap<u8, u16> = HashMap::new();
            for op in ops {
                match op {
                    Op::Push(k, p) => {
                        heap.push(k, p);
                        model.insert(k, p);
                    }
                    Op::Pop => {
                        let popped = heap.pop();
                        let min = model.values().min().copied();
                        prop_assert_eq!(popped.map(|(_, p)| p), min);
                        if let Some((k, _)) = popped {
                            prop_assert!(model.remove(&k).is_some());
                        }
                    }
                    Op::Remove(k) => {
                        prop_assert_eq!(heap.remove(&k), model.remove(&k));
                    }
                }
                prop_assert_eq!(heap.len(), model.len());
            }
            let mut last = None;
            while let Some((_, p)) = heap.pop() {
                if let Some(prev) = last {
                    prop_assert!(prev <= p);
                }
                last = Some(p);
            }
        }
    }
}
