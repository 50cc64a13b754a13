//! Arena-backed AVL map with order statistics.
//!
//! Keys and values are small `Copy` types; nodes live in a [`Pool`] so
//! the map shares the simulator's memory budget. Subtree sizes are kept
//! on every node, which gives rank selection (`nth`) in `O(log k)` — the
//! population is sampled uniformly through it.

use crate::error::Result;
use crate::pool::{MemoryGauge, Pool};

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Default)]
struct Node<K, V> {
    key: K,
    value: V,
    left: u32,
    right: u32,
    height: u8,
    size: u32,
}

#[derive(Debug)]
pub struct AvlMap<K, V> {
    pool: Pool<Node<K, V>>,
    root: u32,
}

impl<K, V> AvlMap<K, V>
where
    K: Ord + Copy + Default,
    V: Copy + Default,
{
    pub fn new(block_size: usize) -> Self {
        Self { pool: Pool::new(block_size), root: NIL }
    }

    pub fn len(&self) -> usize {
        self.size(self.root) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Reserve room for `count` upcoming insertions.
    pub fn ensure_free(&mut self, count: usize, gauge: &mut MemoryGauge) -> Result<()> {
        self.pool.ensure_free(count, gauge)
    }

    pub fn live_nodes(&self) -> usize {
        self.pool.live()
    }

    pub fn peak_nodes(&self) -> usize {
        self.pool.peak_live()
    }

    fn height(&self, n: u32) -> i32 {
        if n == NIL { 0 } else { self.pool.get(n).height as i32 }
    }

    fn size(&self, n: u32) -> u32 {
        if n == NIL { 0 } else { self.pool.get(n).size }
    }

    fn update(&mut self, n: u32) {
        let (l, r) = {
            let node = self.pool.get(n);
            (node.left, node.right)
        };
        let height = 1 + self.height(l).max(self.height(r));
        let size = 1 + self.size(l) + self.size(r);
        let node = self.pool.get_mut(n);
        node.height = height as u8;
        node.size = size;
    }

    fn rotate_left(&mut self, n: u32) -> u32 {
        let r = self.pool.get(n).right;
        let rl = self.pool.get(r).left;
        self.pool.get_mut(n).right = rl;
        self.pool.get_mut(r).left = n;
        self.update(n);
        self.update(r);
        r
    }

    fn rotate_right(&mut self, n: u32) -> u32 {
        let l = self.pool.get(n).left;
        let lr = self.pool.get(l).right;
        self.pool.get_mut(n).left = lr;
        self.pool.get_mut(l).right = n;
        self.update(n);
        self.update(l);
        l
    }

    fn balance_factor(&self, n: u32) -> i32 {
        let node = self.pool.get(n);
        self.height(node.left) - self.height(node.right)
    }

    fn rebalance(&mut self, n: u32) -> u32 {
        self.update(n);
        let bf = self.balance_factor(n);
        if bf > 1 {
            if self.balance_factor(self.pool.get(n).left) < 0 {
                let rotated = self.rotate_left(self.pool.get(n).left);
                self.pool.get_mut(n).left = rotated;
            }
            self.rotate_right(n)
        } else if bf < -1 {
            if self.balance_factor(self.pool.get(n).right) > 0 {
                let rotated = self.rotate_right(self.pool.get(n).right);
                self.pool.get_mut(n).right = rotated;
            }
            self.rotate_left(n)
        } else {
            n
        }
    }

    fn find_node(&self, key: K) -> u32 {
        let mut n = self.root;
        while n != NIL {
            let node = self.pool.get(n);
            if key < node.key {
                n = node.left;
            } else if key > node.key {
                n = node.right;
            } else {
                return n;
            }
        }
        NIL
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.find_node(key) != NIL
    }

    pub fn get(&self, key: K) -> Option<V> {
        let n = self.find_node(key);
        if n == NIL { None } else { Some(self.pool.get(n).value) }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let n = self.find_node(key);
        if n == NIL { None } else { Some(&mut self.pool.get_mut(n).value) }
    }

    /// Insert `key → value`; an existing binding is replaced and returned.
    pub fn insert(&mut self, key: K, value: V, gauge: &mut MemoryGauge) -> Result<Option<V>> {
        let existing = self.find_node(key);
        if existing != NIL {
            let node = self.pool.get_mut(existing);
            let old = node.value;
            node.value = value;
            return Ok(Some(old));
        }
        let fresh = self.pool.alloc(gauge)?;
        *self.pool.get_mut(fresh) =
            Node { key, value, left: NIL, right: NIL, height: 1, size: 1 };
        self.root = self.insert_at(self.root, fresh);
        Ok(None)
    }

    fn insert_at(&mut self, n: u32, fresh: u32) -> u32 {
        if n == NIL {
            return fresh;
        }
        if self.pool.get(fresh).key < self.pool.get(n).key {
            let sub = self.insert_at(self.pool.get(n).left, fresh);
            self.pool.get_mut(n).left = sub;
        } else {
            let sub = self.insert_at(self.pool.get(n).right, fresh);
            self.pool.get_mut(n).right = sub;
        }
        self.rebalance(n)
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let mut removed = NIL;
        self.root = self.remove_at(self.root, key, &mut removed);
        if removed == NIL {
            return None;
        }
        let value = self.pool.get(removed).value;
        self.pool.free(removed);
        Some(value)
    }

    fn remove_at(&mut self, n: u32, key: K, removed: &mut u32) -> u32 {
        if n == NIL {
            return NIL;
        }
        let (node_key, left, right) = {
            let node = self.pool.get(n);
            (node.key, node.left, node.right)
        };
        if key < node_key {
            let sub = self.remove_at(left, key, removed);
            self.pool.get_mut(n).left = sub;
        } else if key > node_key {
            let sub = self.remove_at(right, key, removed);
            self.pool.get_mut(n).right = sub;
        } else {
            *removed = n;
            if left == NIL {
                return right;
            }
            if right == NIL {
                return left;
            }
            // Two children: lift the in-order successor into this slot.
            // The detached successor node carries the removed value back
            // to the caller.
            let (new_right, successor) = self.detach_min(right);
            let (succ_key, succ_value) = {
                let succ = self.pool.get(successor);
                (succ.key, succ.value)
            };
            let node = self.pool.get_mut(n);
            let removed_value = node.value;
            node.key = succ_key;
            node.value = succ_value;
            node.right = new_right;
            self.pool.get_mut(successor).value = removed_value;
            *removed = successor;
        }
        self.rebalance(n)
    }

    /// Remove the minimum of the subtree at `n`; returns the new subtree
    /// root and the detached node index.
    fn detach_min(&mut self, n: u32) -> (u32, u32) {
        let left = self.pool.get(n).left;
        if left == NIL {
            return (self.pool.get(n).right, n);
        }
        let (new_left, min) = self.detach_min(left);
        self.pool.get_mut(n).left = new_left;
        (self.rebalance(n), min)
    }

    pub fn min(&self) -> Option<(K, V)> {
        let mut n = self.root;
        if n == NIL {
            return None;
        }
        while self.pool.get(n).left != NIL {
            n = self.pool.get(n).left;
        }
        let node = self.pool.get(n);
        Some((node.key, node.value))
    }

    /// Entry with in-order rank `rank` (0-based).
    pub fn nth(&self, mut rank: usize) -> Option<(K, V)> {
        if rank >= self.len() {
            return None;
        }
        let mut n = self.root;
        loop {
            let node = self.pool.get(n);
            let left_size = self.size(node.left) as usize;
            if rank < left_size {
                n = node.left;
            } else if rank == left_size {
                return Some((node.key, node.value));
            } else {
                rank -= left_size + 1;
                n = node.right;
            }
        }
    }

    /// Greatest entry whose key is `<= key`.
    pub fn floor(&self, key: K) -> Option<(K, V)> {
        let mut best = NIL;
        let mut n = self.root;
        while n != NIL {
            let node = self.pool.get(n);
            if node.key <= key {
                best = n;
                n = node.right;
            } else {
                n = node.left;
            }
        }
        if best == NIL {
            None
        } else {
            let node = self.pool.get(best);
            Some((node.key, node.value))
        }
    }

    /// Smallest entry whose key is strictly greater than `key`.
    pub fn next_above(&self, key: K) -> Option<(K, V)> {
        let mut best = NIL;
        let mut n = self.root;
        while n != NIL {
            let node = self.pool.get(n);
            if node.key > key {
                best = n;
                n = node.left;
            } else {
                n = node.right;
            }
        }
        if best == NIL {
            None
        } else {
            let node = self.pool.get(best);
            Some((node.key, node.value))
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { map: self, stack: Vec::new() };
        iter.push_left_spine(self.root);
        iter
    }
}

pub struct Iter<'a, K, V> {
    map: &'a AvlMap<K, V>,
    stack: Vec<u32>,
}

impl<'a, K, V> Iter<'a, K, V>
where
    K: Ord + Copy + Default,
    V: Copy + Default,
{
    fn push_left_spine(&mut self, mut n: u32) {
        while n != NIL {
            self.stack.push(n);
            n = self.map.pool.get(n).left;
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Ord + Copy + Default,
    V: Copy + Default,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let n = self.stack.pop()?;
        let node = self.map.pool.get(n);
        self.push_left_spine(node.right);
        Some((node.key, node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn gauge() -> MemoryGauge {
        MemoryGauge::new(1 << 24)
    }

    #[test]
    fn insert_get_remove() {
        let mut gauge = gauge();
        let mut map: AvlMap<u32, u32> = AvlMap::new(16);
        assert!(map.is_empty());
        for k in [5u32, 2, 8, 1, 9, 3] {
            assert_eq!(map.insert(k, k * 10, &mut gauge).unwrap(), None);
        }
        assert_eq!(map.len(), 6);
        assert_eq!(map.get(8), Some(80));
        assert_eq!(map.get(4), None);
        assert_eq!(map.insert(8, 88, &mut gauge).unwrap(), Some(80));
        assert_eq!(map.remove(8), Some(88));
        assert_eq!(map.remove(8), None);
        assert_eq!(map.len(), 5);
        *map.get_mut(2).unwrap() -= 1;
        assert_eq!(map.get(2), Some(19));
    }

    #[test]
    fn ordered_queries() {
        let mut gauge = gauge();
        let mut map: AvlMap<u32, u32> = AvlMap::new(16);
        for k in [10u32, 20, 30, 40] {
            map.insert(k, k, &mut gauge).unwrap();
        }
        assert_eq!(map.min(), Some((10, 10)));
        assert_eq!(map.nth(0), Some((10, 10)));
        assert_eq!(map.nth(2), Some((30, 30)));
        assert_eq!(map.nth(4), None);
        assert_eq!(map.floor(25), Some((20, 20)));
        assert_eq!(map.floor(20), Some((20, 20)));
        assert_eq!(map.floor(5), None);
        assert_eq!(map.next_above(20), Some((30, 30)));
        assert_eq!(map.next_above(40), None);
        let keys: Vec<u32> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30, 40]);
    }

    #[test]
    fn agrees_with_btreemap() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut gauge = gauge();
        let mut map: AvlMap<u32, u64> = AvlMap::new(64);
        let mut oracle: BTreeMap<u32, u64> = BTreeMap::new();
        for step in 0..4000u64 {
            let key = rng.random_range(0..512u32);
            if rng.random_bool(0.6) {
                let prev = map.insert(key, step, &mut gauge).unwrap();
                assert_eq!(prev, oracle.insert(key, step));
            } else {
                assert_eq!(map.remove(key), oracle.remove(&key));
            }
            assert_eq!(map.len(), oracle.len());
        }
        let ours: Vec<(u32, u64)> = map.iter().collect();
        let theirs: Vec<(u32, u64)> = oracle.iter().map(|(&k, &v)| (k, v)).collect();
        assert_eq!(ours, theirs);
        for (rank, &(k, v)) in theirs.iter().enumerate() {
            assert_eq!(map.nth(rank), Some((k, v)));
        }
        for probe in 0..512u32 {
            let floor = oracle.range(..=probe).next_back().map(|(&k, &v)| (k, v));
            assert_eq!(map.floor(probe), floor);
            let above = oracle
                .range(probe + 1..)
                .next()
                .map(|(&k, &v)| (k, v));
            assert_eq!(map.next_above(probe), above);
        }
    }

    #[test]
    fn nodes_are_recycled() {
        let mut gauge = gauge();
        let mut map: AvlMap<u32, u32> = AvlMap::new(8);
        for k in 0..8 {
            map.insert(k, k, &mut gauge).unwrap();
        }
        for k in 0..8 {
            map.remove(k);
        }
        let used = gauge.used();
        for k in 100..108 {
            map.insert(k, k, &mut gauge).unwrap();
        }
        assert_eq!(gauge.used(), used);
        assert_eq!(map.live_nodes(), 8);
        assert_eq!(map.peak_nodes(), 8);
    }
}
