//! Indexed min-heap of connection timeouts.
//!
//! Nodes live in a plain array ordered as a binary heap on their expiry. A
//! side table maps each id to the slot currently holding it, so renewals and
//! removals by id stay O(log n).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Action run when a timer fires.
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode<K> {
    id: K,
    expires: Instant,
    cb: TimeoutCallback,
}

pub struct HeapTimer<K> {
    heap: Vec<TimerNode<K>>,
    refs: HashMap<K, usize>,
}

impl<K> HeapTimer<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            refs: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.refs.contains_key(&id)
    }

    /// Arms a timer for `id`. An id that is already armed is renewed: its
    /// expiry moves and its callback is replaced.
    pub fn add<F>(&mut self, id: K, timeout: Duration, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expires = Instant::now() + timeout;
        match self.refs.get(&id) {
            None => {
                let i = self.heap.len();
                self.refs.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Box::new(cb),
                });
                self.sift_up(i);
            }
            Some(&i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = Box::new(cb);
                self.restore(i);
            }
        }
    }

    /// Moves the expiry of `id` to `now + timeout`. Returns `false` if `id`
    /// has no timer.
    ///
    /// Renewals are expected to push the expiry later, which only ever needs
    /// a sift-down; an earlier expiry is still handled.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        let Some(&i) = self.refs.get(&id) else {
            return false;
        };
        self.heap[i].expires = Instant::now() + timeout;
        self.restore(i);
        true
    }

    /// Removes the timer for `id` and runs its callback, whether or not it
    /// is due.
    pub fn do_work(&mut self, id: K) {
        if let Some(&i) = self.refs.get(&id) {
            let node = self.del(i);
            (node.cb)();
        }
    }

    /// Removes the timer for `id` without running its callback.
    pub fn cancel(&mut self, id: K) -> bool {
        match self.refs.get(&id) {
            Some(&i) => {
                self.del(i);
                true
            }
            None => false,
        }
    }

    /// Fires every expired timer, earliest first.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.del(0);
            (node.cb)();
        }
    }

    /// Drops the earliest timer without running it.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.del(0);
        }
    }

    pub fn clear(&mut self) {
        self.refs.clear();
        self.heap.clear();
    }

    /// Fires expired timers, then returns the time left until the next one.
    /// `None` means no timer is armed.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(Instant::now()))
    }

    /// Takes the node at slot `i` out of the heap and re-establishes order.
    fn del(&mut self, i: usize) -> TimerNode<K> {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_node(i, last);
        }
        let node = self
            .heap
            .pop()
            .unwrap_or_else(|| unreachable!("del on empty heap"));
        self.refs.remove(&node.id);
        if i < self.heap.len() {
            self.restore(i);
        }
        node
    }

    /// The element at `i` may need to move either way after an update.
    fn restore(&mut self, i: usize) {
        if !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_node(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut j = i * 2 + 1;
        while j < n {
            if j + 1 < n && self.heap[j + 1].expires < self.heap[j].expires {
                j += 1;
            }
            if self.heap[i].expires <= self.heap[j].expires {
                break;
            }
            self.swap_node(i, j);
            i = j;
            j = i * 2 + 1;
        }
        i > index
    }

    fn swap_node(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.refs.insert(self.heap[i].id, i);
        self.refs.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.heap.len(), self.refs.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.refs.get(&node.id), Some(&i), "stale index entry");
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    self.heap[parent].expires <= node.expires,
                    "heap order violated at slot {i}"
                );
            }
        }
    }
}

impl<K> Default for HeapTimer<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for HeapTimer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapTimer")
            .field("len", &self.heap.len())
            .field("next", &self.heap.first().map(|n| (&n.id, n.expires)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn noop() {}

    #[test]
    fn test_tick_fires_in_expiry_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut timer = HeapTimer::new();
        let base = Instant::now();

        for (id, ms) in [(1, 30u64), (2, 10), (3, 20)] {
            let fired = fired.clone();
            timer.add(id, Duration::from_millis(ms), move || fired.lock().unwrap().push(id));
        }
        timer.assert_invariants();

        timer.tick_at(base + Duration::from_secs(1));
        assert_eq!(*fired.lock().unwrap(), vec![2, 3, 1]);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_tick_without_expired_nodes_keeps_size() {
        let mut timer = HeapTimer::new();
        timer.add(1, Duration::from_secs(60), noop);
        timer.add(2, Duration::from_secs(90), noop);

        timer.tick();
        assert_eq!(timer.len(), 2);
        timer.assert_invariants();
    }

    #[test]
    fn test_add_existing_id_renews_and_replaces_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        timer.add(7, Duration::ZERO, || panic!("replaced callback must not run"));

        let h = hits.clone();
        timer.add(7, Duration::from_secs(60), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.len(), 1);

        timer.tick();
        assert_eq!(timer.len(), 1, "renewed timer should not be due yet");

        timer.do_work(7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timer.contains(7));
    }

    #[test]
    fn test_adjust_moves_node_toward_leaves() {
        let mut timer = HeapTimer::new();
        for id in 0..8 {
            timer.add(id, Duration::from_millis(100 + id as u64), noop);
        }
        assert!(timer.adjust(0, Duration::from_secs(60)));
        timer.assert_invariants();
        assert_ne!(timer.refs[&0], 0);
        assert!(!timer.adjust(99, Duration::from_secs(1)));
    }

    #[test]
    fn test_cancel_skips_callback() {
        let mut timer = HeapTimer::new();
        timer.add(1, Duration::ZERO, || panic!("cancelled callback ran"));
        timer.add(2, Duration::from_secs(5), noop);

        assert!(timer.cancel(1));
        assert!(!timer.cancel(1));
        timer.tick();
        assert_eq!(timer.len(), 1);
        timer.assert_invariants();
    }

    #[test]
    fn test_next_tick() {
        let mut timer: HeapTimer<u32> = HeapTimer::new();
        assert_eq!(timer.next_tick(), None);

        timer.add(1, Duration::ZERO, noop);
        timer.add(2, Duration::from_secs(10), noop);
        let wait = timer.next_tick().unwrap();
        assert_eq!(timer.len(), 1);
        assert!(wait <= Duration::from_secs(10));
        assert!(wait > Duration::from_secs(9));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u16),
        Adjust(u8, u16),
        Cancel(u8),
        DoWork(u8),
        Pop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..32, 0u16..500).prop_map(|(id, ms)| Op::Add(id, ms)),
            (0u8..32, 0u16..500).prop_map(|(id, ms)| Op::Adjust(id, ms)),
            (0u8..32).prop_map(Op::Cancel),
            (0u8..32).prop_map(Op::DoWork),
            Just(Op::Pop),
        ]
    }

    proptest! {
        /// Heap order and the index table survive any operation sequence.
        #[test]
        fn prop_invariants_hold(ops in prop::collection::vec(op(), 0..128)) {
            let mut timer = HeapTimer::new();
            let mut live = std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Add(id, ms) => {
                        timer.add(id, Duration::from_millis(ms.into()), noop);
                        live.insert(id);
                    }
                    Op::Adjust(id, ms) => {
                        let known = timer.adjust(id, Duration::from_millis(ms.into()));
                        prop_assert_eq!(known, live.contains(&id));
                    }
                    Op::Cancel(id) => {
                        timer.cancel(id);
                        live.remove(&id);
                    }
                    Op::DoWork(id) => {
                        timer.do_work(id);
                        live.remove(&id);
                    }
                    Op::Pop => {
                        if let Some(root) = timer.heap.first() {
                            live.remove(&root.id);
                        }
                        timer.pop();
                    }
                }
                timer.assert_invariants();
                prop_assert_eq!(timer.len(), live.len());
            }
        }
    }
}
