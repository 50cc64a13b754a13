//! Haplotype generation: materialize the segregating-site matrix from a
//! tree sequence and its mutations.
//!
//! The whole bit matrix is filled eagerly: every marginal tree is
//! visited once and each of its mutations triggers one subtree
//! traversal, setting the site's bit for every sample below the
//! mutated node.

use bitvec::prelude::*;

use crate::error::{Error, Result};
use crate::trees::{TreeFlags, TreeSequence};

pub struct HaplotypeGenerator {
    sample_size: u32,
    num_sites: usize,
    /// Row-major `sample_size × num_sites` bit matrix.
    matrix: BitVec<u64, Lsb0>,
}

impl HaplotypeGenerator {
    pub fn new(ts: &TreeSequence) -> Result<Self> {
        let num_sites = ts.num_mutations();
        if num_sites > u32::MAX as usize {
            return Err(Error::TooManySegregatingSites);
        }
        let sample_size = ts.sample_size();
        let mut generator = Self {
            sample_size,
            num_sites,
            matrix: bitvec![u64, Lsb0; 0; sample_size as usize * num_sites],
        };
        let mut iter = ts.trees(TreeFlags::empty())?;
        let mut site = 0usize;
        let mut stack = Vec::with_capacity(sample_size as usize);
        while iter.advance() {
            let tree = iter.tree();
            for mutation in tree.mutations() {
                stack.clear();
                stack.push(mutation.node);
                while let Some(u) = stack.pop() {
                    if u >= 1 && u <= sample_size {
                        generator.set(u, site);
                    } else {
                        let children = tree.children_of(u)?;
                        if children[0] != 0 {
                            stack.extend(children);
                        }
                    }
                }
                site += 1;
            }
        }
        debug_assert_eq!(site, num_sites);
        Ok(generator)
    }

    fn set(&mut self, sample: u32, site: usize) {
        let row = (sample - 1) as usize;
        self.matrix.set(row * self.num_sites + site, true);
    }

    pub fn num_segregating_sites(&self) -> usize {
        self.num_sites
    }

    /// Whether `sample_id` carries the derived allele at `site`.
    pub fn derived(&self, sample_id: u32, site: usize) -> Result<bool> {
        if sample_id == 0 || sample_id > self.sample_size {
            return Err(Error::OutOfBounds);
        }
        if site >= self.num_sites {
            return Err(Error::OutOfBounds);
        }
        Ok(self.matrix[(sample_id - 1) as usize * self.num_sites + site])
    }

    /// The 0/1 haplotype string for one sample (ids are `1..=n`).
    pub fn haplotype(&self, sample_id: u32) -> Result<String> {
        if sample_id == 0 || sample_id > self.sample_size {
            return Err(Error::OutOfBounds);
        }
        let row = (sample_id - 1) as usize;
        let bits = &self.matrix[row * self.num_sites..(row + 1) * self.num_sites];
        Ok(bits.iter().map(|b| if *b { '1' } else { '0' }).collect())
    }
}
