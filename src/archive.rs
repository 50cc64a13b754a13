//! The on-disk archive for tree sequences.
//!
//! A little-endian container with a hierarchical logical layout:
//!
//! - header: magic, `format_version {major, minor}`, `sample_size`,
//!   `num_loci`, record and mutation counts, filter flags
//! - group `trees`: datasets `left`, `right`, `node` (`u32[R]`),
//!   `children` (`u32[R][2]`), `time` (`f64[R]`), then the
//!   `environment` and `parameters` JSON attributes
//! - group `mutations` (present only when mutations exist): datasets
//!   `node` (`u32[M]`), `position` (`f64[M]`) and the same two
//!   attributes
//!
//! Every dataset is stored as a single full-size chunk followed by its
//! Fletcher-32 checksum. [`DumpFlags::ZLIB_COMPRESSION`] applies a
//! byte-shuffle and deflate at level 9 to each chunk before it is
//! written. Loaders verify checksums and refuse a mismatched major
//! version.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bitflags::bitflags;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{Error, Result};
use crate::trees::{Provenance, TreeSequence};

const ARCHIVE_MAGIC: u32 = 0xCA1E_5CE1;
pub const FORMAT_VERSION_MAJOR: u32 = 1;
pub const FORMAT_VERSION_MINOR: u32 = 0;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DumpFlags: u32 {
        /// Byte-shuffle each chunk and deflate it at level 9.
        const ZLIB_COMPRESSION = 1 << 0;
    }
}

// ── Checksums and filters ─────────────────────────────────────────────────────

/// Fletcher-32 over the stored chunk bytes (odd trailing byte padded
/// with zero).
fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for pair in data.chunks(2) {
        let word = pair[0] as u32 | ((pair.get(1).copied().unwrap_or(0) as u32) << 8);
        sum1 = (sum1 + word) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    (sum2 << 16) | sum1
}

/// Byte transpose: all first bytes of the elements, then all second
/// bytes, and so on. Improves deflate on numeric columns.
fn shuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    let count = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for byte in 0..element_size {
        for element in 0..count {
            out[byte * count + element] = data[element * element_size + byte];
        }
    }
    out
}

fn unshuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    let count = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for byte in 0..element_size {
        for element in 0..count {
            out[element * element_size + byte] = data[byte * count + element];
        }
    }
    out
}

// ── Primitive writers / readers ───────────────────────────────────────────────

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// One dataset: raw LE bytes, filtered per the flags, length-prefixed
/// and checksummed.
fn write_chunk(
    w: &mut impl Write,
    raw: &[u8],
    element_size: usize,
    flags: DumpFlags,
) -> Result<()> {
    let stored: Vec<u8> = if flags.contains(DumpFlags::ZLIB_COMPRESSION) {
        let shuffled = shuffle(raw, element_size);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
        encoder.write_all(&shuffled)?;
        encoder.finish()?
    } else {
        raw.to_vec()
    };
    write_u64(w, stored.len() as u64)?;
    w.write_all(&stored)?;
    write_u32(w, fletcher32(&stored))?;
    Ok(())
}

fn read_chunk(
    r: &mut impl Read,
    raw_len: usize,
    element_size: usize,
    compressed: bool,
) -> Result<Vec<u8>> {
    let stored_len = read_u64(r)? as usize;
    let mut stored = vec![0u8; stored_len];
    r.read_exact(&mut stored)?;
    let checksum = read_u32(r)?;
    if checksum != fletcher32(&stored) {
        return Err(Error::FileFormat("dataset checksum mismatch".into()));
    }
    let raw = if compressed {
        let mut decoder = ZlibDecoder::new(&stored[..]);
        let mut shuffled = Vec::with_capacity(raw_len);
        decoder.read_to_end(&mut shuffled)?;
        if shuffled.len() != raw_len {
            return Err(Error::FileFormat("dataset length mismatch".into()));
        }
        unshuffle(&shuffled, element_size)
    } else {
        if stored.len() != raw_len {
            return Err(Error::FileFormat("dataset length mismatch".into()));
        }
        stored
    };
    Ok(raw)
}

fn u32s_to_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f64s_to_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn bytes_to_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

fn write_attribute(w: &mut impl Write, value: &str, flags: DumpFlags) -> Result<()> {
    write_chunk(w, value.as_bytes(), 1, flags)
}

fn read_attribute(r: &mut impl Read, compressed: bool) -> Result<String> {
    let stored_len = read_u64(r)? as usize;
    let mut stored = vec![0u8; stored_len];
    r.read_exact(&mut stored)?;
    let checksum = read_u32(r)?;
    if checksum != fletcher32(&stored) {
        return Err(Error::FileFormat("attribute checksum mismatch".into()));
    }
    let raw = if compressed {
        let mut decoder = ZlibDecoder::new(&stored[..]);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        bytes
    } else {
        stored
    };
    let text = String::from_utf8(raw)
        .map_err(|_| Error::FileFormat("attribute is not valid UTF-8".into()))?;
    if !text.is_empty() {
        serde_json::from_str::<serde_json::Value>(&text)
            .map_err(|_| Error::FileFormat("attribute is not valid JSON".into()))?;
    }
    Ok(text)
}

// ── Dump / load ───────────────────────────────────────────────────────────────

pub fn dump(ts: &TreeSequence, path: &Path, flags: DumpFlags) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    write_u32(&mut w, ARCHIVE_MAGIC)?;
    write_u32(&mut w, FORMAT_VERSION_MAJOR)?;
    write_u32(&mut w, FORMAT_VERSION_MINOR)?;
    write_u32(&mut w, ts.sample_size())?;
    write_u32(&mut w, ts.num_loci())?;
    write_u64(&mut w, ts.num_records() as u64)?;
    write_u64(&mut w, ts.num_mutations() as u64)?;
    write_u32(&mut w, flags.bits())?;

    let records: Vec<_> = ts.records().collect();
    let left: Vec<u32> = records.iter().map(|r| r.left).collect();
    let right: Vec<u32> = records.iter().map(|r| r.right).collect();
    let node: Vec<u32> = records.iter().map(|r| r.node).collect();
    let children: Vec<u32> = records.iter().flat_map(|r| r.children).collect();
    let time: Vec<f64> = records.iter().map(|r| r.time).collect();

    write_chunk(&mut w, &u32s_to_bytes(&left), 4, flags)?;
    write_chunk(&mut w, &u32s_to_bytes(&right), 4, flags)?;
    write_chunk(&mut w, &u32s_to_bytes(&node), 4, flags)?;
    write_chunk(&mut w, &u32s_to_bytes(&children), 4, flags)?;
    write_chunk(&mut w, &f64s_to_bytes(&time), 8, flags)?;
    write_attribute(&mut w, &ts.trees_provenance().environment, flags)?;
    write_attribute(&mut w, &ts.trees_provenance().parameters, flags)?;

    if ts.num_mutations() > 0 {
        let (nodes, positions) = ts.mutation_columns();
        write_chunk(&mut w, &u32s_to_bytes(nodes), 4, flags)?;
        write_chunk(&mut w, &f64s_to_bytes(positions), 8, flags)?;
        let provenance = ts.mutations_provenance().cloned().unwrap_or_default();
        write_attribute(&mut w, &provenance.environment, flags)?;
        write_attribute(&mut w, &provenance.parameters, flags)?;
    }

    w.flush()?;
    Ok(())
}

pub fn load(path: &Path) -> Result<TreeSequence> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    if read_u32(&mut r)? != ARCHIVE_MAGIC {
        return Err(Error::FileFormat("bad magic number".into()));
    }
    let major = read_u32(&mut r)?;
    let _minor = read_u32(&mut r)?;
    if major != FORMAT_VERSION_MAJOR {
        return Err(Error::UnsupportedFileVersion { major });
    }
    let sample_size = read_u32(&mut r)?;
    let num_loci = read_u32(&mut r)?;
    let num_records = read_u64(&mut r)? as usize;
    let num_mutations = read_u64(&mut r)? as usize;
    let flags = DumpFlags::from_bits_truncate(read_u32(&mut r)?);
    let compressed = flags.contains(DumpFlags::ZLIB_COMPRESSION);
    if num_records == 0 {
        return Err(Error::FileFormat("archive holds no records".into()));
    }

    let left = bytes_to_u32s(&read_chunk(&mut r, num_records * 4, 4, compressed)?);
    let right = bytes_to_u32s(&read_chunk(&mut r, num_records * 4, 4, compressed)?);
    let node = bytes_to_u32s(&read_chunk(&mut r, num_records * 4, 4, compressed)?);
    let children_flat = bytes_to_u32s(&read_chunk(&mut r, num_records * 8, 4, compressed)?);
    let time = bytes_to_f64s(&read_chunk(&mut r, num_records * 8, 8, compressed)?);
    let children: Vec<[u32; 2]> =
        children_flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
    let trees_provenance = Provenance {
        environment: read_attribute(&mut r, compressed)?,
        parameters: read_attribute(&mut r, compressed)?,
    };

    let mutations = if num_mutations > 0 {
        let nodes = bytes_to_u32s(&read_chunk(&mut r, num_mutations * 4, 4, compressed)?);
        let positions = bytes_to_f64s(&read_chunk(&mut r, num_mutations * 8, 8, compressed)?);
        let provenance = Provenance {
            environment: read_attribute(&mut r, compressed)?,
            parameters: read_attribute(&mut r, compressed)?,
        };
        Some((nodes, positions, provenance))
    } else {
        None
    };

    TreeSequence::from_columns(
        sample_size,
        num_loci,
        left,
        right,
        node,
        children,
        time,
        trees_provenance,
        mutations,
    )
}
