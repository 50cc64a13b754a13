use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod archive;
mod avl;
pub mod error;
mod fenwick;
pub mod hapgen;
pub mod newick;
mod pool;
pub mod tree_file;
pub mod trees;

pub use error::{Error, Result};
pub use hapgen::HaplotypeGenerator;
pub use newick::NewickConverter;
pub use trees::{
    Mutation, Order, SparseTree, SparseTreeIterator, TreeDiff, TreeDiffIterator, TreeFlags,
    TreeSequence,
};

use avl::AvlMap;
use fenwick::Fenwick;
use pool::{MemoryGauge, Pool};

const NIL: u32 = u32::MAX;

/// Placeholder node on records of fully coalesced intervals; patched to
/// the grand-MRCA id when the finished records are read out.
const UNASSIGNED_NODE: u32 = 0;

// ── Population models ─────────────────────────────────────────────────────────

/// Effective population size through time, as a sequence of epochs.
///
/// `Constant` sets the relative size to `size` from `start_time` on;
/// `Exponential` scales it as `N(t) = N(start_time) · exp(-alpha · (t -
/// start_time))` going backwards in time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PopulationModel {
    Constant { start_time: f64, size: f64 },
    Exponential { start_time: f64, alpha: f64 },
}

impl PopulationModel {
    pub fn start_time(&self) -> f64 {
        match *self {
            PopulationModel::Constant { start_time, .. } => start_time,
            PopulationModel::Exponential { start_time, .. } => start_time,
        }
    }
}

/// A model made concrete: the size at its start is carried over from the
/// epochs before it.
#[derive(Clone, Copy, Debug)]
struct Epoch {
    start_time: f64,
    model: PopulationModel,
    initial_size: f64,
}

impl Epoch {
    fn size_at(&self, time: f64) -> f64 {
        match self.model {
            PopulationModel::Constant { size, .. } => size,
            PopulationModel::Exponential { alpha, .. } => {
                self.initial_size * (-alpha * (time - self.start_time)).exp()
            }
        }
    }
}

fn resolve_epochs(models: &[PopulationModel]) -> Result<Vec<Epoch>> {
    let mut epochs = vec![Epoch {
        start_time: 0.0,
        model: PopulationModel::Constant { start_time: 0.0, size: 1.0 },
        initial_size: 1.0,
    }];
    let mut last_start = 0.0;
    for model in models {
        let start_time = model.start_time();
        if !start_time.is_finite() || start_time < 0.0 {
            return Err(Error::BadPopModel);
        }
        if start_time < last_start {
            return Err(Error::UnsortedPopModels);
        }
        last_start = start_time;
        match *model {
            PopulationModel::Constant { size, .. } => {
                if !(size > 0.0) || !size.is_finite() {
                    return Err(Error::BadPopModel);
                }
            }
            PopulationModel::Exponential { alpha, .. } => {
                if !alpha.is_finite() {
                    return Err(Error::BadPopModel);
                }
            }
        }
        let initial_size = match *model {
            PopulationModel::Constant { size, .. } => size,
            PopulationModel::Exponential { .. } => epochs.last().unwrap().size_at(start_time),
        };
        epochs.push(Epoch { start_time, model: *model, initial_size });
    }
    Ok(epochs)
}

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub sample_size: u32,
    pub num_loci: u32,
    /// Scaled recombination rate per link.
    pub recombination_rate: f64,
    pub random_seed: u64,
    /// Size-change epochs sorted by start time. An implicit `constant(1)`
    /// applies from time 0 until the first entry.
    pub population_models: Vec<PopulationModel>,
    /// Hard cap, in bytes, on all per-instance allocation.
    pub max_memory: usize,
    pub segment_block_size: usize,
    pub avl_node_block_size: usize,
    pub node_mapping_block_size: usize,
    pub coalescence_record_block_size: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        let mut rng = rand::rng();
        Self {
            sample_size: 10,
            num_loci: 100,
            recombination_rate: 0.0,
            random_seed: rng.random_range(1..u64::MAX),
            population_models: Vec::new(),
            max_memory: 100 * 1024 * 1024,
            segment_block_size: 1024,
            avl_node_block_size: 1024,
            node_mapping_block_size: 1024,
            coalescence_record_block_size: 1024,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Over `[left, right)`, internal `node` became the parent of the two
/// `children` (stored ascending) at `time`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoalescenceRecord {
    pub left: u32,
    pub right: u32,
    pub node: u32,
    pub children: [u32; 2],
    pub time: f64,
}

/// Why a `run` call returned. The two limit statuses are pauses: state
/// stays consistent and `run` can be called again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    MaxTimeReached,
    MaxEventsReached,
}

// ── Ancestral material ────────────────────────────────────────────────────────

/// One stretch of ancestral material: loci `[left, right)` carried for
/// ARG node `value`, linked forward within its lineage.
#[derive(Clone, Copy, Debug)]
struct Segment {
    left: u32,
    right: u32,
    value: u32,
    next: u32,
}

impl Default for Segment {
    fn default() -> Self {
        Self { left: 0, right: 0, value: 0, next: NIL }
    }
}

/// Fenwick slots are 1-based, segment arena indices 0-based.
fn link_slot(segment: u32) -> usize {
    segment as usize + 1
}

// ── Simulator ─────────────────────────────────────────────────────────────────

/// Coalescent-with-recombination simulator over `n` sampled haploid
/// genomes of `m` discrete loci.
///
/// Lineages are linked lists of segments. The population is an ordered
/// map keyed on `(head left, head index)`; per-lineage link counts live
/// in a Fenwick tree slotted by head segment, giving the `O(log n)`
/// weighted choice of the lineage to recombine.
pub struct Simulator {
    config: SimulatorConfig,
    rng: SmallRng,
    time: f64,
    next_node: u32,
    epochs: Vec<Epoch>,
    epoch_index: usize,
    memory: MemoryGauge,
    segments: Pool<Segment>,
    links: Fenwick,
    population: AvlMap<(u32, u32), u32>,
    /// Step function, keyed by run start: how many lineages still carry
    /// ancestral material at each locus. A merge where the count is 2 is
    /// the final coalescence there.
    overlap_counts: AvlMap<u32, u32>,
    records: Vec<CoalescenceRecord>,
    records_charged: usize,
    num_ca_events: u64,
    num_re_events: u64,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Result<Self> {
        let n = config.sample_size;
        let m = config.num_loci;
        if n < 2 {
            return Err(Error::BadParameter("sample_size must be at least 2"));
        }
        if n > 1 << 30 {
            return Err(Error::PopulationOverflow);
        }
        if m < 1 {
            return Err(Error::BadParameter("num_loci must be at least 1"));
        }
        if m > 1 << 30 {
            return Err(Error::LinksOverflow);
        }
        if !config.recombination_rate.is_finite() || config.recombination_rate < 0.0 {
            return Err(Error::BadParameter("recombination_rate must be non-negative"));
        }
        let epochs = resolve_epochs(&config.population_models)?;
        let epoch_index = epochs
            .iter()
            .rposition(|e| e.start_time <= 0.0)
            .unwrap_or(0);

        let mut memory = MemoryGauge::new(config.max_memory);
        let mut segments = Pool::new(config.segment_block_size);
        let mut population = AvlMap::new(config.avl_node_block_size);
        let mut overlap_counts = AvlMap::new(config.node_mapping_block_size);

        segments.ensure_free(n as usize, &mut memory)?;
        population.ensure_free(n as usize, &mut memory)?;
        overlap_counts.ensure_free(2, &mut memory)?;
        let mut links = Fenwick::new(segments.capacity());

        for sample in 1..=n {
            let head = segments.alloc(&mut memory)?;
            *segments.get_mut(head) = Segment { left: 1, right: m + 1, value: sample, next: NIL };
            links.set(link_slot(head), (m - 1) as u64);
            population.insert((1, head), head, &mut memory)?;
        }
        overlap_counts.insert(1, n, &mut memory)?;
        overlap_counts.insert(m + 1, 0, &mut memory)?;

        let mut sim = Self {
            rng: SmallRng::seed_from_u64(config.random_seed),
            time: 0.0,
            next_node: n + 1,
            epochs,
            epoch_index,
            memory,
            segments,
            links,
            population,
            overlap_counts,
            records: Vec::new(),
            records_charged: 0,
            num_ca_events: 0,
            num_re_events: 0,
            config,
        };
        sim.reserve_records(1)?;
        Ok(sim)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Current simulation time, in coalescent units.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn num_ancestors(&self) -> usize {
        self.population.len()
    }

    pub fn is_complete(&self) -> bool {
        self.population.is_empty()
    }

    pub fn num_coalescence_records(&self) -> usize {
        self.records.len()
    }

    pub fn num_coalescence_events(&self) -> u64 {
        self.num_ca_events
    }

    pub fn num_recombination_events(&self) -> u64 {
        self.num_re_events
    }

    pub fn used_memory(&self) -> usize {
        self.memory.used()
    }

    pub fn peak_memory(&self) -> usize {
        self.memory.peak()
    }

    /// Raise (or lower) the memory cap, letting a run paused by
    /// `MaxMemoryExceeded` continue.
    pub fn set_max_memory(&mut self, bytes: usize) {
        self.memory.set_limit(bytes);
    }

    pub fn num_live_segments(&self) -> usize {
        self.segments.live()
    }

    pub fn peak_segments(&self) -> usize {
        self.segments.peak_live()
    }

    /// Write a diagnostic dump of the live state: the lineages with
    /// their segment chains and link counts, the overlap-count map, and
    /// the allocator gauges.
    pub fn print_state(&self, out: &mut dyn std::io::Write) -> Result<()> {
        writeln!(out, "simulation state @ t = {:.6}", self.time)?;
        writeln!(out, "epoch {} of {}", self.epoch_index + 1, self.epochs.len())?;
        writeln!(
            out,
            "events: {} coalescence, {} recombination",
            self.num_ca_events, self.num_re_events
        )?;
        writeln!(
            out,
            "memory: {} used, {} peak, {} cap",
            self.memory.used(),
            self.memory.peak(),
            self.memory.limit()
        )?;
        writeln!(
            out,
            "segments: {} live ({} peak); tree nodes: {} live ({} peak)",
            self.segments.live(),
            self.segments.peak_live(),
            self.population.live_nodes() + self.overlap_counts.live_nodes(),
            self.population.peak_nodes() + self.overlap_counts.peak_nodes()
        )?;
        match self.population.min() {
            Some(((left, _), _)) => writeln!(
                out,
                "population: {} lineages, leftmost head at locus {}",
                self.population.len(),
                left
            )?,
            None => writeln!(out, "population: fully coalesced")?,
        }
        for (_, head) in self.population.iter() {
            write!(out, "\t")?;
            let mut cur = head;
            while cur != NIL {
                let seg = self.segments.get(cur);
                write!(out, "[{}, {}) -> {}  ", seg.left, seg.right, seg.value)?;
                cur = seg.next;
            }
            writeln!(out, "| {} links", self.links.get(link_slot(head)))?;
        }
        writeln!(out, "overlap counts:")?;
        for (locus, count) in self.overlap_counts.iter() {
            writeln!(out, "\t{locus} -> {count}")?;
        }
        Ok(())
    }

    /// The finished records in emission (time) order, with fully
    /// coalesced intervals patched to the grand-MRCA node id. Only
    /// available once the simulation has completed.
    pub fn coalescence_records(&self) -> Result<Vec<CoalescenceRecord>> {
        if !self.is_complete() {
            return Err(Error::BadMode);
        }
        let grand = self.next_node;
        Ok(self
            .records
            .iter()
            .map(|&record| CoalescenceRecord {
                node: if record.node == UNASSIGNED_NODE { grand } else { record.node },
                ..record
            })
            .collect())
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    /// Run until every locus has coalesced, the simulation clock reaches
    /// `max_time`, or `max_events` events have fired in this call. Both
    /// limits are polled once per iteration.
    pub fn run(&mut self, max_time: f64, max_events: u64) -> Result<RunStatus> {
        let mut events = 0u64;
        while !self.population.is_empty() {
            if self.time >= max_time {
                return Ok(RunStatus::MaxTimeReached);
            }
            if events >= max_events {
                return Ok(RunStatus::MaxEventsReached);
            }
            let k = self.population.len() as u64;
            debug_assert!(k >= 2, "a lone lineage cannot carry unresolved material");
            let total_links = self.links.total();

            let t_r = if self.config.recombination_rate > 0.0 && total_links > 0 {
                let e: f64 = self.rng.sample(Exp1);
                e / (self.config.recombination_rate * total_links as f64)
            } else {
                f64::INFINITY
            };
            let e: f64 = self.rng.sample(Exp1);
            let t_c = self.coalescence_waiting_time(e / (k * (k - 1)) as f64);
            let wait = t_c.min(t_r);

            if self.epoch_index + 1 < self.epochs.len() {
                let boundary = self.epochs[self.epoch_index + 1].start_time;
                if self.time + wait >= boundary {
                    // Cross into the next epoch and redraw; no event
                    // fires at the boundary itself.
                    if boundary > max_time {
                        self.time = max_time;
                        return Ok(RunStatus::MaxTimeReached);
                    }
                    self.time = boundary;
                    self.epoch_index += 1;
                    debug!(time = self.time, epoch = self.epoch_index, "population model change");
                    continue;
                }
            } else if wait.is_infinite() {
                // Terminal shrinking epoch: the sample can never finish
                // coalescing under this model.
                return Err(Error::BadPopModel);
            }
            if self.time + wait > max_time {
                self.time = max_time;
                return Ok(RunStatus::MaxTimeReached);
            }

            self.time += wait;
            if t_r < t_c {
                self.recombination_event()?;
            } else {
                self.coalescence_event()?;
            }
            events += 1;
        }
        debug!(
            time = self.time,
            records = self.records.len(),
            coalescences = self.num_ca_events,
            recombinations = self.num_re_events,
            "simulation complete"
        );
        Ok(RunStatus::Complete)
    }

    /// Real waiting time to the next coalescence given the Exp(1)
    /// variate already divided by `k(k-1)`; the hazard is integrated in
    /// closed form under the active epoch.
    fn coalescence_waiting_time(&self, scaled: f64) -> f64 {
        let epoch = &self.epochs[self.epoch_index];
        match epoch.model {
            PopulationModel::Constant { size, .. } => size * scaled,
            PopulationModel::Exponential { alpha, .. } => {
                if alpha == 0.0 {
                    return epoch.initial_size * scaled;
                }
                let dt = self.time - epoch.start_time;
                let z = (alpha * dt).exp() + alpha * epoch.initial_size * scaled;
                if z > 0.0 { z.ln() / alpha - dt } else { f64::INFINITY }
            }
        }
    }

    // ── Recombination ─────────────────────────────────────────────────────────

    fn recombination_event(&mut self) -> Result<()> {
        self.reserve_segments(1)?;
        self.population.ensure_free(1, &mut self.memory)?;

        let h = self.rng.random_range(1..=self.links.total());
        let slot = self.links.find(h);
        let head = (slot - 1) as u32;
        let offset = (h - self.links.prefix_sum(slot - 1)) as u32;
        let head_left = self.segments.get(head).left;
        let ancestor_links = self.links.get(slot) as u32;
        debug_assert!(offset >= 1 && offset <= ancestor_links);
        // First locus owned by the new lineage.
        let break_locus = head_left + offset;
        let tail_right = head_left + ancestor_links + 1;

        // Find the segment the break falls into, or the one right after
        // the gap it falls between.
        let mut prev = NIL;
        let mut cur = head;
        loop {
            let seg = *self.segments.get(cur);
            if break_locus < seg.right {
                break;
            }
            prev = cur;
            cur = seg.next;
            debug_assert!(cur != NIL);
        }
        let seg = *self.segments.get(cur);
        let (new_head, new_left, old_tail_right) = if break_locus > seg.left {
            // Split inside `cur`: [left, b) stays, [b, right) leads the
            // new lineage.
            let fresh = self.segments.alloc(&mut self.memory)?;
            *self.segments.get_mut(fresh) = Segment {
                left: break_locus,
                right: seg.right,
                value: seg.value,
                next: seg.next,
            };
            let trimmed = self.segments.get_mut(cur);
            trimmed.right = break_locus;
            trimmed.next = NIL;
            (fresh, break_locus, break_locus)
        } else {
            // The break falls in the gap before `cur`: detach the tail.
            debug_assert!(prev != NIL);
            self.segments.get_mut(prev).next = NIL;
            (cur, seg.left, self.segments.get(prev).right)
        };

        self.links
            .set(link_slot(head), (old_tail_right - 1 - head_left) as u64);
        self.links
            .set(link_slot(new_head), (tail_right - 1 - new_left) as u64);
        self.population
            .insert((new_left, new_head), new_head, &mut self.memory)?;
        self.num_re_events += 1;
        Ok(())
    }

    // ── Coalescence ───────────────────────────────────────────────────────────

    fn coalescence_event(&mut self) -> Result<()> {
        let k = self.population.len();
        let first = self.rng.random_range(0..k);
        let mut second = self.rng.random_range(0..k - 1);
        if second >= first {
            second += 1;
        }
        let (key_x, x_head) = self.population.nth(first).expect("rank in range");
        let (key_y, y_head) = self.population.nth(second).expect("rank in range");

        // Reserve the worst case up front so a budget failure leaves the
        // event unapplied and the run resumable.
        let len_x = self.chain_len(x_head);
        let len_y = self.chain_len(y_head);
        let max_pieces = 2 * (len_x + len_y) + self.overlap_counts.len();
        self.reserve_segments(max_pieces)?;
        self.overlap_counts
            .ensure_free(2 * (len_x + len_y), &mut self.memory)?;
        self.population.ensure_free(1, &mut self.memory)?;
        self.reserve_records(max_pieces)?;

        self.population.remove(key_x);
        self.population.remove(key_y);
        self.links.set(link_slot(x_head), 0);
        self.links.set(link_slot(y_head), 0);
        self.merge(x_head, y_head)?;
        self.num_ca_events += 1;
        Ok(())
    }

    /// Merge two lineages, emitting one record per coalesced
    /// sub-interval (ascending in `left`) and re-inserting whatever
    /// material survives.
    fn merge(&mut self, mut x: u32, mut y: u32) -> Result<()> {
        let time = self.time;
        let mut merged_head = NIL;
        let mut merged_tail = NIL;
        let mut append = |segments: &mut Pool<Segment>, piece: u32| {
            if merged_head == NIL {
                merged_head = piece;
            } else {
                segments.get_mut(merged_tail).next = piece;
            }
            let mut tail = piece;
            while segments.get(tail).next != NIL {
                tail = segments.get(tail).next;
            }
            merged_tail = tail;
        };

        while x != NIL || y != NIL {
            if x == NIL {
                append(&mut self.segments, y);
                y = NIL;
                continue;
            }
            if y == NIL {
                append(&mut self.segments, x);
                x = NIL;
                continue;
            }
            if self.segments.get(y).left < self.segments.get(x).left {
                std::mem::swap(&mut x, &mut y);
            }
            let xs = *self.segments.get(x);
            let ys = *self.segments.get(y);
            if xs.right <= ys.left {
                // x lies wholly before y: it passes through untouched.
                let detached = x;
                x = xs.next;
                self.segments.get_mut(detached).next = NIL;
                append(&mut self.segments, detached);
            } else if xs.left != ys.left {
                // Leading non-overlap of x passes through.
                let fresh = self.segments.alloc(&mut self.memory)?;
                *self.segments.get_mut(fresh) =
                    Segment { left: xs.left, right: ys.left, value: xs.value, next: NIL };
                self.segments.get_mut(x).left = ys.left;
                append(&mut self.segments, fresh);
            } else {
                // Co-initial overlap on [l, r_end), subdivided into runs
                // of equal overlap count.
                let left = xs.left;
                let r_end = xs.right.min(ys.right);
                debug_assert_ne!(xs.value, ys.value);
                let children = if xs.value < ys.value {
                    [xs.value, ys.value]
                } else {
                    [ys.value, xs.value]
                };
                self.split_overlap_boundary(left)?;
                self.split_overlap_boundary(r_end)?;
                let mut run_left = left;
                while run_left < r_end {
                    let count = self
                        .overlap_counts
                        .get(run_left)
                        .expect("boundary was inserted");
                    let run_right = self
                        .overlap_counts
                        .next_above(run_left)
                        .map(|(key, _)| key)
                        .expect("upper boundary was inserted")
                        .min(r_end);
                    if count == 2 {
                        // These two lineages are the last pair at these
                        // loci: record and drop the material.
                        *self.overlap_counts.get_mut(run_left).unwrap() = 0;
                        self.records.push(CoalescenceRecord {
                            left: run_left,
                            right: run_right,
                            node: UNASSIGNED_NODE,
                            children,
                            time,
                        });
                    } else {
                        *self.overlap_counts.get_mut(run_left).unwrap() = count - 1;
                        let node = self.next_node;
                        self.next_node += 1;
                        self.records.push(CoalescenceRecord {
                            left: run_left,
                            right: run_right,
                            node,
                            children,
                            time,
                        });
                        let fresh = self.segments.alloc(&mut self.memory)?;
                        *self.segments.get_mut(fresh) =
                            Segment { left: run_left, right: run_right, value: node, next: NIL };
                        append(&mut self.segments, fresh);
                    }
                    run_left = run_right;
                }
                // Trim both inputs past the processed stretch.
                if xs.right == r_end {
                    let spent = x;
                    x = xs.next;
                    self.segments.free(spent);
                } else {
                    self.segments.get_mut(x).left = r_end;
                }
                if ys.right == r_end {
                    let spent = y;
                    y = ys.next;
                    self.segments.free(spent);
                } else {
                    self.segments.get_mut(y).left = r_end;
                }
            }
        }

        self.defrag_overlap_counts();

        if merged_head != NIL {
            let tail_right = self.defrag_chain(merged_head);
            let head_left = self.segments.get(merged_head).left;
            self.links
                .set(link_slot(merged_head), (tail_right - 1 - head_left) as u64);
            self.population
                .insert((head_left, merged_head), merged_head, &mut self.memory)?;
        }
        Ok(())
    }

    /// Ensure the overlap-count step function has a key at `locus`.
    fn split_overlap_boundary(&mut self, locus: u32) -> Result<()> {
        if self.overlap_counts.contains_key(locus) {
            return Ok(());
        }
        let (_, value) = self
            .overlap_counts
            .floor(locus)
            .expect("map covers locus 1 onwards");
        self.overlap_counts.insert(locus, value, &mut self.memory)?;
        Ok(())
    }

    /// Drop redundant breakpoints: adjacent runs with equal counts merge.
    fn defrag_overlap_counts(&mut self) {
        let mut stale = Vec::new();
        let mut prev: Option<u32> = None;
        for (key, value) in self.overlap_counts.iter() {
            if prev == Some(value) {
                stale.push(key);
            }
            prev = Some(value);
        }
        for key in stale {
            self.overlap_counts.remove(key);
        }
    }

    /// Join touching same-node pieces of a chain; returns the tail's
    /// `right`.
    fn defrag_chain(&mut self, head: u32) -> u32 {
        let mut cur = head;
        loop {
            let seg = *self.segments.get(cur);
            if seg.next == NIL {
                return seg.right;
            }
            let next = *self.segments.get(seg.next);
            if seg.right == next.left && seg.value == next.value {
                let absorbed = seg.next;
                let joined = self.segments.get_mut(cur);
                joined.right = next.right;
                joined.next = next.next;
                self.segments.free(absorbed);
            } else {
                cur = seg.next;
            }
        }
    }

    fn chain_len(&self, head: u32) -> usize {
        let mut n = 0;
        let mut cur = head;
        while cur != NIL {
            n += 1;
            cur = self.segments.get(cur).next;
        }
        n
    }

    /// Grow the segment pool and keep the link tree covering it.
    fn reserve_segments(&mut self, count: usize) -> Result<()> {
        self.segments.ensure_free(count, &mut self.memory)?;
        if self.links.len() < self.segments.capacity() {
            self.links.expand(self.segments.capacity());
        }
        Ok(())
    }

    /// Charge the record store against the budget, a block at a time.
    fn reserve_records(&mut self, count: usize) -> Result<()> {
        let block = self.config.coalescence_record_block_size.max(1);
        while self.records.len() + count > self.records_charged {
            self.memory.charge(block * size_of::<CoalescenceRecord>())?;
            self.records_charged += block;
        }
        if self.records.capacity() < self.records_charged {
            self.records.reserve(self.records_charged - self.records.len());
        }
        Ok(())
    }
}
