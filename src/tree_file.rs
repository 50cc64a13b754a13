//! The legacy flat tree-file container.
//!
//! Layout: a 28-byte header `{magic, version, sample_size, num_loci,
//! flags, metadata_offset: u64}`, a run of 20-byte record blobs
//! `{left, child0, child1, parent, time as f32 bits}` and a JSON
//! metadata trailer. Flag bit 0 marks a complete file, bit 1 a file
//! whose records have been sorted by `left`.
//!
//! The `right` coordinate is not stored; it is inferred when a sorted,
//! complete file is converted into a [`TreeSequence`]: sweeping the
//! records left to right, a record leaves the marginal tree exactly
//! when a later record claims one of its children, and records never
//! superseded extend to `num_loci + 1`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{Error, Result};
use crate::trees::{Provenance, TreeSequence, environment_json};
use crate::{CoalescenceRecord, Simulator};

const TREE_FILE_MAGIC: u32 = 0xa52c_d4a4;
const TREE_FILE_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 28;
const RECORD_SIZE: u64 = 20;

const FLAG_COMPLETE: u32 = 1;
const FLAG_SORTED: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Update,
}

pub struct TreeFile {
    file: File,
    path: PathBuf,
    mode: Mode,
    sample_size: u32,
    num_loci: u32,
    flags: u32,
    metadata_offset: u64,
    metadata: Option<String>,
}

fn encode_record(record: &CoalescenceRecord) -> [u8; RECORD_SIZE as usize] {
    let mut buf = [0u8; RECORD_SIZE as usize];
    buf[0..4].copy_from_slice(&record.left.to_le_bytes());
    buf[4..8].copy_from_slice(&record.children[0].to_le_bytes());
    buf[8..12].copy_from_slice(&record.children[1].to_le_bytes());
    buf[12..16].copy_from_slice(&record.node.to_le_bytes());
    buf[16..20].copy_from_slice(&(record.time as f32).to_bits().to_le_bytes());
    buf
}

fn decode_record(buf: &[u8; RECORD_SIZE as usize]) -> CoalescenceRecord {
    let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
    CoalescenceRecord {
        left: u32_at(0),
        // The stored form has no right coordinate.
        right: 0,
        children: [u32_at(4), u32_at(8)],
        node: u32_at(12),
        time: f32::from_bits(u32_at(16)) as f64,
    }
}

impl TreeFile {
    pub fn open(path: &Path, mode: Mode) -> Result<Self> {
        match mode {
            Mode::Read => Self::open_existing(path, Mode::Read, false),
            Mode::Update => Self::open_existing(path, Mode::Update, true),
            Mode::Write => {
                let mut file = File::create(path)?;
                file.write_all(&[0u8; HEADER_SIZE as usize])?;
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                    mode,
                    sample_size: 0,
                    num_loci: 0,
                    flags: 0,
                    metadata_offset: 0,
                    metadata: None,
                })
            }
        }
    }

    fn open_existing(path: &Path, mode: Mode, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let u32_at =
            |o: usize| u32::from_le_bytes([header[o], header[o + 1], header[o + 2], header[o + 3]]);
        if u32_at(0) != TREE_FILE_MAGIC {
            return Err(Error::FileFormat("bad tree-file magic".into()));
        }
        let version = u32_at(4);
        if version != TREE_FILE_VERSION {
            return Err(Error::FileVersion(version));
        }
        let sample_size = u32_at(8);
        let num_loci = u32_at(12);
        let flags = u32_at(16);
        let metadata_offset = u64::from_le_bytes([
            header[20], header[21], header[22], header[23], header[24], header[25], header[26],
            header[27],
        ]);
        let mut metadata = None;
        if metadata_offset >= HEADER_SIZE {
            file.seek(SeekFrom::Start(metadata_offset))?;
            let mut text = String::new();
            file.read_to_string(&mut text)?;
            metadata = Some(text);
        }
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
            sample_size,
            num_loci,
            flags,
            metadata_offset,
            metadata,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&TREE_FILE_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&TREE_FILE_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&self.sample_size.to_le_bytes());
        header[12..16].copy_from_slice(&self.num_loci.to_le_bytes());
        header[16..20].copy_from_slice(&self.flags.to_le_bytes());
        header[20..28].copy_from_slice(&self.metadata_offset.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn num_loci(&self) -> u32 {
        self.num_loci
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.flags & FLAG_COMPLETE != 0
    }

    pub fn is_sorted(&self) -> bool {
        self.flags & FLAG_SORTED != 0
    }

    // ── Write mode ────────────────────────────────────────────────────────────

    pub fn set_sample_size(&mut self, sample_size: u32) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::BadMode);
        }
        self.sample_size = sample_size;
        Ok(())
    }

    pub fn set_num_loci(&mut self, num_loci: u32) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::BadMode);
        }
        self.num_loci = num_loci;
        Ok(())
    }

    pub fn append_record(&mut self, record: &CoalescenceRecord) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::BadMode);
        }
        self.file.write_all(&encode_record(record))?;
        Ok(())
    }

    /// Write the metadata trailer, mark the file complete, and flush.
    pub fn finalise(&mut self, metadata: &str) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::BadMode);
        }
        self.metadata_offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(metadata.as_bytes())?;
        self.flags |= FLAG_COMPLETE;
        self.write_header()?;
        self.file.flush()?;
        Ok(())
    }

    /// Convenience: write a completed simulation out in one call.
    pub fn dump_simulation(path: &Path, sim: &Simulator) -> Result<()> {
        let mut tf = Self::open(path, Mode::Write)?;
        tf.set_sample_size(sim.config().sample_size)?;
        tf.set_num_loci(sim.config().num_loci)?;
        for record in sim.coalescence_records()? {
            tf.append_record(&record)?;
        }
        let metadata = json!({
            "environment": environment_json(),
            "parameters": {
                "random_seed": sim.config().random_seed,
                "sample_size": sim.config().sample_size,
                "num_loci": sim.config().num_loci,
                "scaled_recombination_rate": sim.config().recombination_rate,
                "population_models": sim.config().population_models,
            },
        })
        .to_string();
        tf.finalise(&metadata)
    }

    // ── Update mode ───────────────────────────────────────────────────────────

    /// Sort the stored records by `(left, time)` in place and set the
    /// sorted flag. The stored f32 times round-trip unchanged.
    pub fn sort(&mut self) -> Result<()> {
        if self.mode != Mode::Update {
            return Err(Error::BadMode);
        }
        let mut records = self.read_raw_records()?;
        records.sort_by(|a, b| a.left.cmp(&b.left).then(a.time.total_cmp(&b.time)));
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        for record in &records {
            self.file.write_all(&encode_record(record))?;
        }
        self.flags |= FLAG_SORTED;
        self.write_header()?;
        self.file.flush()?;
        Ok(())
    }

    // ── Read mode ─────────────────────────────────────────────────────────────

    fn num_stored_records(&self) -> u64 {
        (self.metadata_offset - HEADER_SIZE) / RECORD_SIZE
    }

    fn read_raw_records(&mut self) -> Result<Vec<CoalescenceRecord>> {
        if !self.is_complete() {
            return Err(Error::BadMode);
        }
        let count = self.num_stored_records();
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut records = Vec::with_capacity(count as usize);
        let mut buf = [0u8; RECORD_SIZE as usize];
        for _ in 0..count {
            self.file.read_exact(&mut buf)?;
            records.push(decode_record(&buf));
        }
        Ok(records)
    }

    /// The stored records in file order. `right` is 0 on every record,
    /// since the container does not keep it.
    pub fn records(&mut self) -> Result<Vec<CoalescenceRecord>> {
        if self.mode != Mode::Read {
            return Err(Error::BadMode);
        }
        self.read_raw_records()
    }

    /// Infer the missing `right` coordinates from a complete, sorted
    /// file and build a tree sequence.
    pub fn to_tree_sequence(&mut self) -> Result<TreeSequence> {
        if self.mode != Mode::Read {
            return Err(Error::BadMode);
        }
        if !self.is_sorted() {
            return Err(Error::BadOrdering);
        }
        let mut records = self.read_raw_records()?;
        // The on-disk sort used the same key; re-sorting here keeps the
        // sweep correct even for f32-narrowed time ties.
        records.sort_by(|a, b| a.left.cmp(&b.left).then(a.time.total_cmp(&b.time)));
        infer_rights(&mut records, self.num_loci);
        // Back into emission order for the columnar store.
        records.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.left.cmp(&b.left)));

        let provenance = match self.metadata.as_deref().map(serde_json::from_str::<serde_json::Value>)
        {
            Some(Ok(value)) => Provenance {
                environment: value
                    .get("environment")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                parameters: value
                    .get("parameters")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            },
            _ => Provenance::default(),
        };
        TreeSequence::from_records(self.sample_size, self.num_loci, &records, provenance)
    }
}

/// Sweep records sorted by `(left, time)` and assign each one its right
/// boundary: a record ends where a later record re-parents one of its
/// children; survivors extend to `num_loci + 1`.
fn infer_rights(records: &mut [CoalescenceRecord], num_loci: u32) {
    let mut active: HashMap<u32, usize> = HashMap::new();
    for j in 0..records.len() {
        let left = records[j].left;
        let children = records[j].children;
        for child in children {
            if let Some(&ended) = active.get(&child) {
                records[ended].right = left;
                for other in records[ended].children {
                    active.remove(&other);
                }
            }
        }
        for child in children {
            active.insert(child, j);
        }
    }
    for (_, &j) in active.iter() {
        records[j].right = num_loci + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trees::Order;
    use crate::{RunStatus, SimulatorConfig};
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("coalescent_rs_{}_{}", std::process::id(), name))
    }

    fn completed_simulator(seed: u64) -> Simulator {
        let mut sim = Simulator::new(SimulatorConfig {
            sample_size: 7,
            num_loci: 25,
            recombination_rate: 0.5,
            random_seed: seed,
            ..SimulatorConfig::default()
        })
        .unwrap();
        assert_eq!(sim.run(f64::INFINITY, u64::MAX).unwrap(), RunStatus::Complete);
        sim
    }

    #[test]
    fn header_and_flags_round_trip() {
        let path = scratch_path("header.dat");
        let sim = completed_simulator(9);
        TreeFile::dump_simulation(&path, &sim).unwrap();

        let tf = TreeFile::open(&path, Mode::Read).unwrap();
        assert_eq!(tf.sample_size(), 7);
        assert_eq!(tf.num_loci(), 25);
        assert!(tf.is_complete());
        assert!(!tf.is_sorted());
        assert!(tf.metadata().unwrap().contains("scaled_recombination_rate"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mode_checks() {
        let path = scratch_path("modes.dat");
        let sim = completed_simulator(10);
        TreeFile::dump_simulation(&path, &sim).unwrap();

        let mut tf = TreeFile::open(&path, Mode::Read).unwrap();
        let record =
            CoalescenceRecord { left: 1, right: 2, node: 8, children: [1, 2], time: 1.0 };
        assert!(matches!(tf.append_record(&record), Err(Error::BadMode)));
        assert!(matches!(tf.sort(), Err(Error::BadMode)));

        let mut tf = TreeFile::open(&path, Mode::Update).unwrap();
        assert!(matches!(tf.records(), Err(Error::BadMode)));

        // Conversion needs the on-disk sort to have happened first.
        let mut tf = TreeFile::open(&path, Mode::Read).unwrap();
        assert!(matches!(tf.to_tree_sequence(), Err(Error::BadOrdering)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_foreign_files() {
        let path = scratch_path("foreign.dat");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(
            TreeFile::open(&path, Mode::Read),
            Err(Error::FileFormat(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_unknown_version() {
        let path = scratch_path("version.dat");
        let sim = completed_simulator(11);
        TreeFile::dump_simulation(&path, &sim).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            TreeFile::open(&path, Mode::Read),
            Err(Error::FileVersion(7))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn sort_sets_the_flag_and_orders_records() {
        let path = scratch_path("sort.dat");
        let sim = completed_simulator(12);
        TreeFile::dump_simulation(&path, &sim).unwrap();

        let mut tf = TreeFile::open(&path, Mode::Update).unwrap();
        tf.sort().unwrap();

        let mut tf = TreeFile::open(&path, Mode::Read).unwrap();
        assert!(tf.is_sorted());
        let records = tf.records().unwrap();
        assert!(records.windows(2).all(|w| {
            w[0].left < w[1].left || (w[0].left == w[1].left && w[0].time <= w[1].time)
        }));
        std::fs::remove_file(&path).ok();
    }

    /// The legacy round trip recovers the tree sequence, with times
    /// narrowed through f32.
    #[test]
    fn right_inference_recovers_the_tree_sequence() {
        let path = scratch_path("roundtrip.dat");
        let sim = completed_simulator(13);
        let original = TreeSequence::from_simulator(&sim).unwrap();
        TreeFile::dump_simulation(&path, &sim).unwrap();

        let mut tf = TreeFile::open(&path, Mode::Update).unwrap();
        tf.sort().unwrap();
        let mut tf = TreeFile::open(&path, Mode::Read).unwrap();
        let recovered = tf.to_tree_sequence().unwrap();

        assert_eq!(recovered.sample_size(), original.sample_size());
        assert_eq!(recovered.num_loci(), original.num_loci());
        assert_eq!(recovered.num_records(), original.num_records());
        assert_eq!(recovered.num_nodes(), original.num_nodes());
        for j in 0..original.num_records() {
            let a = original.record(j, Order::Time).unwrap();
            let b = recovered.record(j, Order::Time).unwrap();
            assert_eq!((a.left, a.right), (b.left, b.right), "record {j}");
            assert_eq!(a.node, b.node);
            assert_eq!(a.children, b.children);
            assert_eq!(a.time as f32, b.time as f32);
        }
        std::fs::remove_file(&path).ok();
    }
}
