//! Fenwick (binary indexed) tree over non-negative integer weights.
//!
//! Indices are 1-based. Alongside the usual point update and prefix sum,
//! `find` answers the inverse query "smallest index whose prefix sum
//! reaches a target", which is what drives the weighted choice of the
//! lineage to recombine.

#[derive(Debug, Clone)]
pub struct Fenwick {
    /// Interior sums, `tree[0]` unused.
    tree: Vec<u64>,
    /// Plain per-index values, kept for O(1) reads and rebuilds.
    values: Vec<u64>,
    /// Largest power of two not exceeding the size.
    search_bit: usize,
}

impl Fenwick {
    pub fn new(size: usize) -> Self {
        Self {
            tree: vec![0; size + 1],
            values: vec![0; size + 1],
            search_bit: highest_bit(size),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len() - 1
    }

    pub fn get(&self, index: usize) -> u64 {
        self.values[index]
    }

    pub fn increment(&mut self, index: usize, delta: i64) {
        debug_assert!(index >= 1 && index <= self.len());
        let updated = self.values[index]
            .checked_add_signed(delta)
            .expect("fenwick value must stay non-negative");
        self.values[index] = updated;
        let mut j = index;
        while j <= self.len() {
            self.tree[j] = self.tree[j].checked_add_signed(delta).unwrap();
            j += j & j.wrapping_neg();
        }
    }

    pub fn set(&mut self, index: usize, value: u64) {
        let current = self.values[index];
        self.increment(index, value as i64 - current as i64);
    }

    /// Sum of values at `1..=index`.
    pub fn prefix_sum(&self, index: usize) -> u64 {
        let mut sum = 0;
        let mut j = index;
        while j > 0 {
            sum += self.tree[j];
            j -= j & j.wrapping_neg();
        }
        sum
    }

    pub fn total(&self) -> u64 {
        self.prefix_sum(self.len())
    }

    /// Smallest index whose prefix sum is at least `target`.
    ///
    /// For `target == 0` this is index 1. The caller guarantees
    /// `target <= total()`; the descent then never walks past the end.
    pub fn find(&self, target: u64) -> usize {
        let mut j = 0;
        let mut remaining = target;
        let mut half = self.search_bit;
        while half > 0 {
            let k = j + half;
            if k <= self.len() && self.tree[k] < remaining {
                remaining -= self.tree[k];
                j = k;
            }
            half >>= 1;
        }
        j + 1
    }

    /// Grow to `new_size` slots, preserving existing values.
    pub fn expand(&mut self, new_size: usize) {
        debug_assert!(new_size >= self.len());
        self.values.resize(new_size + 1, 0);
        self.tree.clear();
        self.tree.extend_from_slice(&self.values);
        // O(n) rebuild: push each interior sum into its parent.
        for j in 1..=new_size {
            let parent = j + (j & j.wrapping_neg());
            if parent <= new_size {
                self.tree[parent] += self.tree[j];
            }
        }
        self.search_bit = highest_bit(new_size);
    }
}

/// Largest power of two not exceeding `n`, or 0 for `n == 0`.
fn highest_bit(n: usize) -> usize {
    if n == 0 { 0 } else { 1 << (usize::BITS - 1 - n.leading_zeros()) }
}
