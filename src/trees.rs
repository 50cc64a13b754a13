//! The tree sequence: a columnar store of coalescence records indexed
//! for left-to-right traversal of the marginal trees, plus the diff and
//! sparse-tree iterators that walk it and the infinite-sites mutation
//! dropper.

use bitflags::bitflags;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Poisson};
use serde_json::json;

use crate::error::{Error, Result};
use crate::{CoalescenceRecord, Simulator};

/// An infinite-sites mutation: a derived allele at a real-valued
/// position, on the branch above `node`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mutation {
    pub position: f64,
    pub node: u32,
}

/// Record orderings served by [`TreeSequence::record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// Emission order; time-ascending.
    Time,
    /// By `left`, ties by time ascending (insertion order).
    Left,
    /// By `right`, ties by time descending (removal order).
    Right,
}

bitflags! {
    /// Options for [`SparseTree`] construction.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TreeFlags: u32 {
        /// Maintain per-node leaf counts incrementally.
        const COUNT_LEAVES = 1 << 0;
    }
}

/// JSON provenance strings stored alongside the numeric columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Provenance {
    pub environment: String,
    pub parameters: String,
}

pub(crate) fn environment_json() -> serde_json::Value {
    json!({
        "library_version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "family": std::env::consts::FAMILY,
    })
}

// ── Tree sequence ─────────────────────────────────────────────────────────────

/// Sorted, indexed collection of the coalescence records of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSequence {
    sample_size: u32,
    num_loci: u32,
    num_nodes: u32,
    left: Vec<u32>,
    right: Vec<u32>,
    node: Vec<u32>,
    children: Vec<[u32; 2]>,
    time: Vec<f64>,
    /// Permutation: records by `left` ascending, ties by time ascending.
    insertion_order: Vec<u32>,
    /// Permutation: records by `right` ascending, ties by time descending.
    removal_order: Vec<u32>,
    mutation_node: Vec<u32>,
    mutation_position: Vec<f64>,
    trees_provenance: Provenance,
    mutations_provenance: Option<Provenance>,
}

impl TreeSequence {
    /// Build from a completed simulation.
    pub fn from_simulator(sim: &Simulator) -> Result<Self> {
        let records = sim.coalescence_records()?;
        let config = sim.config();
        let parameters = json!({
            "random_seed": config.random_seed,
            "sample_size": config.sample_size,
            "num_loci": config.num_loci,
            "scaled_recombination_rate": config.recombination_rate,
            "population_models": config.population_models,
        })
        .to_string();
        Self::from_records(
            config.sample_size,
            config.num_loci,
            &records,
            Provenance { environment: environment_json().to_string(), parameters },
        )
    }

    /// Build from records already in emission (time) order.
    pub(crate) fn from_records(
        sample_size: u32,
        num_loci: u32,
        records: &[CoalescenceRecord],
        trees_provenance: Provenance,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::BadParameter("a tree sequence needs at least one record"));
        }
        let mut ts = Self {
            sample_size,
            num_loci,
            num_nodes: 0,
            left: records.iter().map(|r| r.left).collect(),
            right: records.iter().map(|r| r.right).collect(),
            node: records.iter().map(|r| r.node).collect(),
            children: records.iter().map(|r| r.children).collect(),
            time: records.iter().map(|r| r.time).collect(),
            insertion_order: Vec::new(),
            removal_order: Vec::new(),
            mutation_node: Vec::new(),
            mutation_position: Vec::new(),
            trees_provenance,
            mutations_provenance: None,
        };
        ts.make_indexes();
        Ok(ts)
    }

    pub(crate) fn from_columns(
        sample_size: u32,
        num_loci: u32,
        left: Vec<u32>,
        right: Vec<u32>,
        node: Vec<u32>,
        children: Vec<[u32; 2]>,
        time: Vec<f64>,
        trees_provenance: Provenance,
        mutations: Option<(Vec<u32>, Vec<f64>, Provenance)>,
    ) -> Result<Self> {
        if left.is_empty()
            || [right.len(), node.len(), children.len(), time.len()]
                .iter()
                .any(|&l| l != left.len())
        {
            return Err(Error::FileFormat("tree column lengths disagree".into()));
        }
        let mut ts = Self {
            sample_size,
            num_loci,
            num_nodes: 0,
            left,
            right,
            node,
            children,
            time,
            insertion_order: Vec::new(),
            removal_order: Vec::new(),
            mutation_node: Vec::new(),
            mutation_position: Vec::new(),
            trees_provenance,
            mutations_provenance: None,
        };
        ts.make_indexes();
        if let Some((nodes, positions, provenance)) = mutations {
            if nodes.len() != positions.len() {
                return Err(Error::FileFormat("mutation column lengths disagree".into()));
            }
            ts.mutation_node = nodes;
            ts.mutation_position = positions;
            ts.mutations_provenance = Some(provenance);
        }
        Ok(ts)
    }

    /// Sort the two index permutations and fix `num_nodes`.
    fn make_indexes(&mut self) {
        let n = self.left.len();
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.sort_by(|&a, &b| {
            self.left[a as usize]
                .cmp(&self.left[b as usize])
                .then(self.time[a as usize].total_cmp(&self.time[b as usize]))
        });
        self.insertion_order = order.clone();
        order.sort_by(|&a, &b| {
            self.right[a as usize]
                .cmp(&self.right[b as usize])
                .then(self.time[b as usize].total_cmp(&self.time[a as usize]))
        });
        self.removal_order = order;
        self.num_nodes = self.node[n - 1];
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn num_loci(&self) -> u32 {
        self.num_loci
    }

    /// Highest node id; the grand-MRCA of the run.
    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    pub fn num_records(&self) -> usize {
        self.left.len()
    }

    pub fn num_mutations(&self) -> usize {
        self.mutation_node.len()
    }

    pub fn trees_provenance(&self) -> &Provenance {
        &self.trees_provenance
    }

    pub fn mutations_provenance(&self) -> Option<&Provenance> {
        self.mutations_provenance.as_ref()
    }

    fn record_at(&self, j: usize) -> CoalescenceRecord {
        CoalescenceRecord {
            left: self.left[j],
            right: self.right[j],
            node: self.node[j],
            children: self.children[j],
            time: self.time[j],
        }
    }

    pub fn record(&self, index: usize, order: Order) -> Result<CoalescenceRecord> {
        if index >= self.num_records() {
            return Err(Error::OutOfBounds);
        }
        let j = match order {
            Order::Time => index,
            Order::Left => self.insertion_order[index] as usize,
            Order::Right => self.removal_order[index] as usize,
        };
        Ok(self.record_at(j))
    }

    /// Records in emission (time) order.
    pub fn records(&self) -> impl Iterator<Item = CoalescenceRecord> + '_ {
        (0..self.num_records()).map(|j| self.record_at(j))
    }

    pub fn mutation(&self, index: usize) -> Result<Mutation> {
        if index >= self.num_mutations() {
            return Err(Error::OutOfBounds);
        }
        Ok(Mutation {
            position: self.mutation_position[index],
            node: self.mutation_node[index],
        })
    }

    /// Mutations in position order.
    pub fn mutations(&self) -> impl Iterator<Item = Mutation> + '_ {
        self.mutation_position
            .iter()
            .zip(&self.mutation_node)
            .map(|(&position, &node)| Mutation { position, node })
    }

    pub(crate) fn mutation_columns(&self) -> (&[u32], &[f64]) {
        (&self.mutation_node, &self.mutation_position)
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Replace the mutations, validating and sorting by position. Any
    /// previously generated provenance is dropped.
    pub fn set_mutations(&mut self, mutations: &[Mutation]) -> Result<()> {
        // The last locus spans [num_loci, num_loci + 1).
        let position_limit = (self.num_loci + 1) as f64;
        for m in mutations {
            if !m.position.is_finite() || m.position < 0.0 || m.position >= position_limit {
                return Err(Error::BadMutation("position outside the genome"));
            }
            if m.node == 0 || m.node > self.num_nodes {
                return Err(Error::BadMutation("node outside [1, num_nodes]"));
            }
        }
        let mut sorted: Vec<Mutation> = mutations.to_vec();
        sorted.sort_by(|a, b| a.position.total_cmp(&b.position));
        self.mutation_position = sorted.iter().map(|m| m.position).collect();
        self.mutation_node = sorted.iter().map(|m| m.node).collect();
        self.mutations_provenance = None;
        Ok(())
    }

    /// Drop infinite-sites mutations over every branch: per record and
    /// child, a Poisson count with mean `rate · branch length · span`,
    /// each at a uniform position within the record's interval.
    pub fn generate_mutations(&mut self, rate: f64, seed: u64) -> Result<()> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(Error::BadParameter("mutation_rate must be non-negative"));
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut node_time = vec![0.0f64; self.num_nodes as usize + 1];
        let mut mutations = Vec::new();
        for j in 0..self.num_records() {
            let record = self.record_at(j);
            node_time[record.node as usize] = record.time;
            let span = (record.right - record.left) as f64;
            for &child in &record.children {
                let branch = record.time - node_time[child as usize];
                let mean = rate * branch * span;
                if mean <= 0.0 {
                    continue;
                }
                let poisson = Poisson::new(mean)
                    .map_err(|_| Error::BadParameter("mutation_rate must be finite"))?;
                let count = poisson.sample(&mut rng) as u64;
                for _ in 0..count {
                    mutations.push(Mutation {
                        position: rng.random_range(record.left as f64..record.right as f64),
                        node: child,
                    });
                }
            }
        }
        self.set_mutations(&mutations)?;
        if !mutations.is_empty() {
            self.mutations_provenance = Some(Provenance {
                environment: environment_json().to_string(),
                parameters: json!({
                    "random_seed": seed,
                    "scaled_mutation_rate": rate,
                })
                .to_string(),
            });
        }
        Ok(())
    }

    // ── Iteration ─────────────────────────────────────────────────────────────

    pub fn diffs(&self) -> TreeDiffIterator<'_> {
        TreeDiffIterator { ts: self, insertion_index: 0, removal_index: 0, tree_left: 1 }
    }

    /// Iterate the marginal trees left to right.
    pub fn trees(&self, flags: TreeFlags) -> Result<SparseTreeIterator<'_>> {
        let tree = SparseTree::new(self.sample_size, self.num_nodes, &[], flags)?;
        SparseTreeIterator::new(self, tree)
    }

    /// As [`Self::trees`], additionally tracking the given leaves.
    pub fn trees_tracking(
        &self,
        tracked_leaves: &[u32],
        flags: TreeFlags,
    ) -> Result<SparseTreeIterator<'_>> {
        let tree = SparseTree::new(self.sample_size, self.num_nodes, tracked_leaves, flags)?;
        SparseTreeIterator::new(self, tree)
    }

    // ── Storage ───────────────────────────────────────────────────────────────

    pub fn dump(&self, path: &std::path::Path, flags: crate::archive::DumpFlags) -> Result<()> {
        crate::archive::dump(self, path, flags)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        crate::archive::load(path)
    }
}

// ── Tree diff iterator ────────────────────────────────────────────────────────

/// One step of the left-to-right walk: the genomic interval length, the
/// records leaving the active tree, and those entering it.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeDiff {
    pub length: u32,
    pub records_out: Vec<CoalescenceRecord>,
    pub records_in: Vec<CoalescenceRecord>,
}

pub struct TreeDiffIterator<'a> {
    ts: &'a TreeSequence,
    insertion_index: usize,
    removal_index: usize,
    tree_left: u32,
}

impl Iterator for TreeDiffIterator<'_> {
    type Item = TreeDiff;

    fn next(&mut self) -> Option<TreeDiff> {
        let ts = self.ts;
        if self.insertion_index >= ts.num_records() {
            return None;
        }
        let mut records_out = Vec::new();
        while ts.right[ts.removal_order[self.removal_index] as usize] == self.tree_left {
            records_out.push(ts.record_at(ts.removal_order[self.removal_index] as usize));
            self.removal_index += 1;
        }
        let mut records_in = Vec::new();
        while self.insertion_index < ts.num_records()
            && ts.left[ts.insertion_order[self.insertion_index] as usize] == self.tree_left
        {
            records_in.push(ts.record_at(ts.insertion_order[self.insertion_index] as usize));
            self.insertion_index += 1;
        }
        let last_left = self.tree_left;
        self.tree_left = ts.right[ts.removal_order[self.removal_index] as usize];
        Some(TreeDiff {
            length: self.tree_left - last_left,
            records_out,
            records_in,
        })
    }
}

// ── Sparse tree ───────────────────────────────────────────────────────────────

/// Dense arrays describing one marginal tree; node 0 encodes "null".
#[derive(Debug, Clone)]
pub struct SparseTree {
    sample_size: u32,
    num_nodes: u32,
    flags: TreeFlags,
    parent: Vec<u32>,
    time: Vec<f64>,
    children: Vec<[u32; 2]>,
    num_leaves: Vec<u32>,
    num_tracked_leaves: Vec<u32>,
    left: u32,
    right: u32,
    root: u32,
    mutations: Vec<Mutation>,
}

impl SparseTree {
    pub fn new(
        sample_size: u32,
        num_nodes: u32,
        tracked_leaves: &[u32],
        flags: TreeFlags,
    ) -> Result<Self> {
        if sample_size == 0 || num_nodes == 0 {
            return Err(Error::BadParameter("empty tree dimensions"));
        }
        let slots = num_nodes as usize + 1;
        let mut tree = Self {
            sample_size,
            num_nodes,
            flags,
            parent: vec![0; slots],
            time: vec![0.0; slots],
            children: vec![[0, 0]; slots],
            num_leaves: Vec::new(),
            num_tracked_leaves: Vec::new(),
            left: 1,
            right: 1,
            root: 0,
            mutations: Vec::new(),
        };
        if flags.contains(TreeFlags::COUNT_LEAVES) {
            tree.num_leaves = vec![0; slots];
            tree.num_tracked_leaves = vec![0; slots];
            for leaf in 1..=sample_size {
                tree.num_leaves[leaf as usize] = 1;
            }
            for &leaf in tracked_leaves {
                if leaf == 0 || leaf > sample_size {
                    return Err(Error::BadParameter("tracked leaf outside the sample"));
                }
                tree.num_tracked_leaves[leaf as usize] = 1;
            }
        } else if !tracked_leaves.is_empty() {
            return Err(Error::UnsupportedOperation);
        }
        Ok(tree)
    }

    fn clear(&mut self) {
        self.left = 1;
        self.right = 1;
        self.root = 0;
        self.parent.fill(0);
        self.time.fill(0.0);
        self.children.fill([0, 0]);
        self.mutations.clear();
        if self.flags.contains(TreeFlags::COUNT_LEAVES) {
            let first_internal = self.sample_size as usize + 1;
            self.num_leaves[first_internal..].fill(0);
            self.num_tracked_leaves[first_internal..].fill(0);
        }
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    /// Genomic interval `[left, right)` this tree spans.
    pub fn interval(&self) -> (u32, u32) {
        (self.left, self.right)
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Mutations falling inside this tree's interval.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    fn check_node(&self, u: u32) -> Result<()> {
        if u == 0 || u > self.num_nodes {
            return Err(Error::BadParameter("node id out of range"));
        }
        Ok(())
    }

    pub fn parent(&self, u: u32) -> Result<u32> {
        self.check_node(u)?;
        Ok(self.parent[u as usize])
    }

    pub fn children_of(&self, u: u32) -> Result<[u32; 2]> {
        self.check_node(u)?;
        Ok(self.children[u as usize])
    }

    pub fn time_of(&self, u: u32) -> Result<f64> {
        self.check_node(u)?;
        Ok(self.time[u as usize])
    }

    /// Most recent common ancestor of `u` and `v` in this tree.
    ///
    /// Both root paths are stacked and then walked top-down in lock
    /// step; the last equal entry is the MRCA. `O(h)`.
    pub fn mrca(&self, u: u32, v: u32) -> Result<u32> {
        self.check_node(u)?;
        self.check_node(v)?;
        let path = |mut w: u32| {
            let mut stack = Vec::with_capacity(self.sample_size as usize + 1);
            while w != 0 {
                stack.push(w);
                w = self.parent[w as usize];
            }
            stack
        };
        let s1 = path(u);
        let s2 = path(v);
        let mut mrca = 0;
        for (a, b) in s1.iter().rev().zip(s2.iter().rev()) {
            if a != b {
                break;
            }
            mrca = *a;
        }
        Ok(mrca)
    }

    /// Leaves below `u`: maintained incrementally when `COUNT_LEAVES` is
    /// set, recomputed by traversal otherwise.
    pub fn num_leaves(&self, u: u32) -> Result<u32> {
        self.check_node(u)?;
        if self.flags.contains(TreeFlags::COUNT_LEAVES) {
            Ok(self.num_leaves[u as usize])
        } else {
            Ok(self.count_leaves_by_traversal(u))
        }
    }

    pub fn num_tracked_leaves(&self, u: u32) -> Result<u32> {
        self.check_node(u)?;
        if !self.flags.contains(TreeFlags::COUNT_LEAVES) {
            return Err(Error::UnsupportedOperation);
        }
        Ok(self.num_tracked_leaves[u as usize])
    }

    fn count_leaves_by_traversal(&self, u: u32) -> u32 {
        let mut stack = vec![u];
        let mut count = 0;
        while let Some(v) = stack.pop() {
            if v >= 1 && v <= self.sample_size {
                count += 1;
            } else if self.children[v as usize][0] != 0 {
                stack.extend(self.children[v as usize]);
            }
        }
        count
    }
}

// ── Sparse tree iterator ──────────────────────────────────────────────────────

/// Moves a [`SparseTree`] across the marginal trees with constant
/// amortized work per step, driven by the two sorted indexes.
pub struct SparseTreeIterator<'a> {
    ts: &'a TreeSequence,
    tree: SparseTree,
    insertion_index: usize,
    removal_index: usize,
    mutation_index: usize,
}

impl<'a> SparseTreeIterator<'a> {
    pub fn new(ts: &'a TreeSequence, mut tree: SparseTree) -> Result<Self> {
        if tree.sample_size != ts.sample_size() || tree.num_nodes != ts.num_nodes() {
            return Err(Error::BadParameter("tree dimensions do not match the sequence"));
        }
        tree.clear();
        Ok(Self { ts, tree, insertion_index: 0, removal_index: 0, mutation_index: 0 })
    }

    pub fn tree(&self) -> &SparseTree {
        &self.tree
    }

    /// Move to the next marginal tree; false when exhausted.
    pub fn advance(&mut self) -> bool {
        let ts = self.ts;
        let t = &mut self.tree;
        if self.insertion_index >= ts.num_records() {
            return false;
        }
        // Remove the records ending at the current right boundary.
        while ts.right[ts.removal_order[self.removal_index] as usize] == t.right {
            let k = ts.removal_order[self.removal_index] as usize;
            let node = ts.node[k];
            let children = ts.children[k];
            for child in children {
                t.parent[child as usize] = 0;
            }
            t.children[node as usize] = [0, 0];
            t.time[node as usize] = 0.0;
            if node == t.root {
                t.root = children[0].max(children[1]);
            }
            self.removal_index += 1;
            if t.flags.contains(TreeFlags::COUNT_LEAVES) {
                let leaves = t.num_leaves[node as usize];
                let tracked = t.num_tracked_leaves[node as usize];
                let mut v = node;
                while v != 0 {
                    t.num_leaves[v as usize] -= leaves;
                    t.num_tracked_leaves[v as usize] -= tracked;
                    v = t.parent[v as usize];
                }
            }
        }
        t.left = t.right;
        t.right = ts.right[ts.removal_order[self.removal_index] as usize];
        // Insert the records starting at the new left boundary.
        while self.insertion_index < ts.num_records()
            && ts.left[ts.insertion_order[self.insertion_index] as usize] == t.left
        {
            let k = ts.insertion_order[self.insertion_index] as usize;
            let node = ts.node[k];
            let children = ts.children[k];
            for child in children {
                t.parent[child as usize] = node;
            }
            t.children[node as usize] = children;
            t.time[node as usize] = ts.time[k];
            if node > t.root {
                t.root = node;
            }
            self.insertion_index += 1;
            if t.flags.contains(TreeFlags::COUNT_LEAVES) {
                let leaves =
                    t.num_leaves[children[0] as usize] + t.num_leaves[children[1] as usize];
                let tracked = t.num_tracked_leaves[children[0] as usize]
                    + t.num_tracked_leaves[children[1] as usize];
                let mut v = node;
                while v != 0 {
                    t.num_leaves[v as usize] += leaves;
                    t.num_tracked_leaves[v as usize] += tracked;
                    v = t.parent[v as usize];
                }
            }
        }
        // The provisional root can sit below the true one.
        while t.parent[t.root as usize] != 0 {
            t.root = t.parent[t.root as usize];
        }
        // Refill the mutations falling inside the new interval.
        t.mutations.clear();
        while self.mutation_index < ts.num_mutations()
            && ts.mutation_position[self.mutation_index] < t.right as f64
        {
            t.mutations.push(Mutation {
                position: ts.mutation_position[self.mutation_index],
                node: ts.mutation_node[self.mutation_index],
            });
            self.mutation_index += 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RunStatus, Simulator, SimulatorConfig};

    fn record(
        left: u32,
        right: u32,
        node: u32,
        children: [u32; 2],
        time: f64,
    ) -> CoalescenceRecord {
        CoalescenceRecord { left, right, node, children, time }
    }

    /// Four samples over ten loci, two marginal trees split at locus 6.
    fn two_tree_sequence() -> TreeSequence {
        let records = vec![
            record(1, 11, 5, [1, 2], 0.5),
            record(1, 11, 6, [3, 4], 0.8),
            record(1, 6, 7, [5, 6], 1.0),
            record(6, 11, 8, [5, 6], 1.5),
        ];
        TreeSequence::from_records(4, 10, &records, Provenance::default()).unwrap()
    }

    fn simulated_sequence(n: u32, m: u32, rho: f64, seed: u64) -> TreeSequence {
        let mut sim = Simulator::new(SimulatorConfig {
            sample_size: n,
            num_loci: m,
            recombination_rate: rho,
            random_seed: seed,
            ..SimulatorConfig::default()
        })
        .unwrap();
        assert_eq!(sim.run(f64::INFINITY, u64::MAX).unwrap(), RunStatus::Complete);
        TreeSequence::from_simulator(&sim).unwrap()
    }

    #[test]
    fn basic_dimensions() {
        let ts = two_tree_sequence();
        assert_eq!(ts.sample_size(), 4);
        assert_eq!(ts.num_loci(), 10);
        assert_eq!(ts.num_records(), 4);
        assert_eq!(ts.num_nodes(), 8);
        assert_eq!(ts.num_mutations(), 0);
    }

    #[test]
    fn record_orderings() {
        let ts = two_tree_sequence();
        assert_eq!(ts.record(0, Order::Time).unwrap().node, 5);
        assert_eq!(ts.record(3, Order::Time).unwrap().node, 8);
        // Insertion order: left ascending, time ascending.
        let by_left: Vec<u32> =
            (0..4).map(|j| ts.record(j, Order::Left).unwrap().node).collect();
        assert_eq!(by_left, vec![5, 6, 7, 8]);
        // Removal order: right ascending, time descending.
        let by_right: Vec<u32> =
            (0..4).map(|j| ts.record(j, Order::Right).unwrap().node).collect();
        assert_eq!(by_right, vec![7, 8, 6, 5]);
        assert!(matches!(ts.record(4, Order::Time), Err(Error::OutOfBounds)));
    }

    #[test]
    fn index_invariants_on_simulated_data() {
        let ts = simulated_sequence(10, 40, 0.5, 21);
        for j in 1..ts.num_records() {
            let a = ts.record(j - 1, Order::Left).unwrap();
            let b = ts.record(j, Order::Left).unwrap();
            assert!(a.left < b.left || (a.left == b.left && a.time <= b.time));
            let a = ts.record(j - 1, Order::Right).unwrap();
            let b = ts.record(j, Order::Right).unwrap();
            assert!(a.right < b.right || (a.right == b.right && a.time >= b.time));
            // Emission order is time order.
            assert!(
                ts.record(j - 1, Order::Time).unwrap().time
                    <= ts.record(j, Order::Time).unwrap().time
            );
        }
    }

    #[test]
    fn diff_iterator_partitions_the_genome() {
        let ts = two_tree_sequence();
        let diffs: Vec<TreeDiff> = ts.diffs().collect();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].length, 5);
        assert_eq!(diffs[0].records_out.len(), 0);
        assert_eq!(diffs[0].records_in.len(), 3);
        assert_eq!(diffs[1].length, 5);
        assert_eq!(diffs[1].records_out[0].node, 7);
        assert_eq!(diffs[1].records_in[0].node, 8);

        let ts = simulated_sequence(8, 60, 0.4, 5);
        let total: u32 = ts.diffs().map(|d| d.length).sum();
        assert_eq!(total, ts.num_loci());
        // In-records arrive time-ascending within each diff.
        for diff in ts.diffs() {
            assert!(diff.records_in.windows(2).all(|w| w[0].time <= w[1].time));
        }
    }

    #[test]
    fn sparse_tree_walks_the_two_tree_example() {
        let ts = two_tree_sequence();
        let mut iter = ts.trees(TreeFlags::empty()).unwrap();

        assert!(iter.advance());
        let tree = iter.tree();
        assert_eq!(tree.interval(), (1, 6));
        assert_eq!(tree.root(), 7);
        assert_eq!(tree.parent(1).unwrap(), 5);
        assert_eq!(tree.parent(5).unwrap(), 7);
        assert_eq!(tree.children_of(7).unwrap(), [5, 6]);
        assert_eq!(tree.time_of(7).unwrap(), 1.0);

        assert!(iter.advance());
        let tree = iter.tree();
        assert_eq!(tree.interval(), (6, 11));
        assert_eq!(tree.root(), 8);
        assert_eq!(tree.parent(5).unwrap(), 8);
        assert_eq!(tree.time_of(7).unwrap(), 0.0);
        assert!(!iter.advance());
    }

    /// Rebuild each marginal tree from scratch and compare against the
    /// incrementally maintained one.
    #[test]
    fn sparse_tree_matches_naive_rebuild() {
        let ts = simulated_sequence(9, 50, 0.6, 33);
        let mut iter = ts.trees(TreeFlags::empty()).unwrap();
        let mut left = 1u32;
        for diff in ts.diffs() {
            let right = left + diff.length;
            assert!(iter.advance());
            let tree = iter.tree();
            assert_eq!(tree.interval(), (left, right));
            let mut parent = vec![0u32; ts.num_nodes() as usize + 1];
            let mut time = vec![0.0f64; ts.num_nodes() as usize + 1];
            let mut root = 0;
            for r in ts.records().filter(|r| r.left <= left && right <= r.right) {
                for c in r.children {
                    parent[c as usize] = r.node;
                }
                time[r.node as usize] = r.time;
                root = root.max(r.node);
            }
            assert_eq!(tree.root(), root);
            for u in 1..=ts.num_nodes() {
                assert_eq!(tree.parent(u).unwrap(), parent[u as usize], "parent of {u}");
                assert_eq!(tree.time_of(u).unwrap(), time[u as usize], "time of {u}");
            }
            left = right;
        }
        assert!(!iter.advance());
    }

    #[test]
    fn leaf_counts_match_traversal() {
        let ts = simulated_sequence(12, 40, 0.5, 55);
        let tracked = [2u32, 5, 11];
        let mut iter = ts.trees_tracking(&tracked, TreeFlags::COUNT_LEAVES).unwrap();
        while iter.advance() {
            let tree = iter.tree();
            for u in 1..=ts.num_nodes() {
                let by_traversal = tree.count_leaves_by_traversal(u);
                assert_eq!(tree.num_leaves(u).unwrap(), by_traversal);
            }
            assert_eq!(tree.num_leaves(tree.root()).unwrap(), 12);
            assert_eq!(tree.num_tracked_leaves(tree.root()).unwrap(), 3);
        }
    }

    #[test]
    fn tracked_leaves_need_the_flag() {
        let ts = two_tree_sequence();
        let mut iter = ts.trees(TreeFlags::empty()).unwrap();
        assert!(iter.advance());
        assert!(matches!(
            iter.tree().num_tracked_leaves(5),
            Err(Error::UnsupportedOperation)
        ));
        // The DFS fallback still answers plain leaf counts.
        assert_eq!(iter.tree().num_leaves(5).unwrap(), 2);
    }

    #[test]
    fn mrca_on_the_two_tree_example() {
        let ts = two_tree_sequence();
        let mut iter = ts.trees(TreeFlags::empty()).unwrap();
        assert!(iter.advance());
        let tree = iter.tree();
        assert_eq!(tree.mrca(1, 2).unwrap(), 5);
        assert_eq!(tree.mrca(1, 3).unwrap(), 7);
        assert_eq!(tree.mrca(3, 4).unwrap(), 6);
        assert_eq!(tree.mrca(1, 1).unwrap(), 1);
        assert_eq!(tree.mrca(5, 1).unwrap(), 5);
        assert!(tree.mrca(0, 1).is_err());
    }

    #[test]
    fn mrca_is_a_maximal_common_ancestor() {
        let ts = simulated_sequence(7, 30, 0.4, 77);
        let mut iter = ts.trees(TreeFlags::empty()).unwrap();
        while iter.advance() {
            let tree = iter.tree();
            for u in 1..=7u32 {
                for v in 1..=7u32 {
                    let w = tree.mrca(u, v).unwrap();
                    // Ancestor of both.
                    for start in [u, v] {
                        let mut x = start;
                        while x != w && x != 0 {
                            x = tree.parent(x).unwrap();
                        }
                        assert_eq!(x, w);
                    }
                    // And no child of it subtends both.
                    if u != v && w != 0 {
                        let children = tree.children_of(w).unwrap();
                        for c in children {
                            if c == 0 {
                                continue;
                            }
                            let under = |mut x: u32| {
                                while x != 0 && x != c {
                                    x = tree.parent(x).unwrap();
                                }
                                x == c
                            };
                            assert!(!(under(u) && under(v)));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn set_mutations_validates_and_sorts() {
        let mut ts = two_tree_sequence();
        let muts = [
            Mutation { position: 7.5, node: 5 },
            Mutation { position: 2.25, node: 1 },
        ];
        ts.set_mutations(&muts).unwrap();
        assert_eq!(ts.num_mutations(), 2);
        assert_eq!(ts.mutation(0).unwrap().position, 2.25);
        assert_eq!(ts.mutation(1).unwrap().node, 5);

        // The last locus spans [10, 11); 10.5 is on it, 11.0 is past it.
        ts.set_mutations(&[Mutation { position: 10.5, node: 1 }]).unwrap();
        assert!(matches!(
            ts.set_mutations(&[Mutation { position: -0.5, node: 1 }]),
            Err(Error::BadMutation(_))
        ));
        assert!(matches!(
            ts.set_mutations(&[Mutation { position: 11.0, node: 1 }]),
            Err(Error::BadMutation(_))
        ));
        assert!(matches!(
            ts.set_mutations(&[Mutation { position: 1.0, node: 0 }]),
            Err(Error::BadMutation(_))
        ));
        assert!(matches!(
            ts.set_mutations(&[Mutation { position: 1.0, node: 9 }]),
            Err(Error::BadMutation(_))
        ));
    }

    #[test]
    fn generated_mutations_are_deterministic_and_sorted() {
        let mut a = simulated_sequence(6, 100, 0.2, 13);
        let mut b = a.clone();
        a.generate_mutations(0.5, 999).unwrap();
        b.generate_mutations(0.5, 999).unwrap();
        assert!(a.num_mutations() > 0);
        let ma: Vec<Mutation> = a.mutations().collect();
        let mb: Vec<Mutation> = b.mutations().collect();
        assert_eq!(ma, mb);
        assert!(ma.windows(2).all(|w| w[0].position <= w[1].position));
        for m in &ma {
            assert!(m.node >= 1 && m.node < a.num_nodes());
            assert!(m.position >= 1.0 && m.position < a.num_loci() as f64 + 1.0);
        }
        assert!(a.mutations_provenance().is_some());
    }

    #[test]
    fn zero_rate_generates_nothing() {
        let mut ts = simulated_sequence(5, 20, 0.1, 3);
        ts.generate_mutations(0.0, 1).unwrap();
        assert_eq!(ts.num_mutations(), 0);
        assert!(ts.mutations_provenance().is_none());
    }

    #[test]
    fn tree_mutations_follow_the_iterator() {
        let mut ts = simulated_sequence(6, 50, 0.3, 29);
        ts.generate_mutations(1.0, 4242).unwrap();
        let mut iter = ts.trees(TreeFlags::empty()).unwrap();
        let mut seen = 0usize;
        while iter.advance() {
            let tree = iter.tree();
            let (left, right) = tree.interval();
            for m in tree.mutations() {
                assert!(m.position >= left as f64);
                assert!(m.position < right as f64);
            }
            seen += tree.mutations().len();
        }
        assert_eq!(seen, ts.num_mutations());
    }

    #[test]
    fn grand_mrca_covers_every_locus() {
        let ts = simulated_sequence(10, 25, 0.8, 61);
        let grand = ts.num_nodes();
        for locus in 1..=ts.num_loci() {
            let covering = ts
                .records()
                .filter(|r| r.left <= locus && locus < r.right && r.node == grand)
                .count();
            assert_eq!(covering, 1);
        }
    }
}
