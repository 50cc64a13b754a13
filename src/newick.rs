//! Newick serialization of the marginal trees.

use crate::error::{Error, Result};
use crate::trees::{SparseTreeIterator, TreeFlags, TreeSequence};

/// Streams `(span, newick)` pairs, one per marginal tree, with branch
/// lengths printed to a fixed number of decimals.
pub struct NewickConverter<'a> {
    iter: SparseTreeIterator<'a>,
    sample_size: u32,
    precision: usize,
}

enum Step {
    Enter(u32),
    Comma,
    Close(u32),
}

impl<'a> NewickConverter<'a> {
    pub fn new(ts: &'a TreeSequence, precision: usize) -> Result<Self> {
        // f64 cannot honour more than 17 significant decimals.
        if precision > 17 {
            return Err(Error::NewickOverflow);
        }
        Ok(Self {
            iter: ts.trees(TreeFlags::empty())?,
            sample_size: ts.sample_size(),
            precision,
        })
    }

    fn format_tree(&self) -> Result<String> {
        let tree = self.iter.tree();
        let mut out = String::new();
        let mut stack = vec![Step::Enter(tree.root())];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(u) => {
                    if u <= self.sample_size {
                        out.push_str(&u.to_string());
                        self.push_branch_length(&mut out, u)?;
                    } else {
                        let children = tree.children_of(u)?;
                        out.push('(');
                        stack.push(Step::Close(u));
                        stack.push(Step::Enter(children[1]));
                        stack.push(Step::Comma);
                        stack.push(Step::Enter(children[0]));
                    }
                }
                Step::Comma => out.push(','),
                Step::Close(u) => {
                    out.push(')');
                    self.push_branch_length(&mut out, u)?;
                }
            }
        }
        out.push(';');
        Ok(out)
    }

    fn push_branch_length(&self, out: &mut String, u: u32) -> Result<()> {
        use std::fmt::Write;
        let tree = self.iter.tree();
        let parent = tree.parent(u)?;
        if parent != 0 {
            let length = tree.time_of(parent)? - tree.time_of(u)?;
            write!(out, ":{:.*}", self.precision, length).expect("writing to a string");
        }
        Ok(())
    }
}

impl Iterator for NewickConverter<'_> {
    type Item = Result<(u32, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.iter.advance() {
            return None;
        }
        let (left, right) = self.iter.tree().interval();
        Some(self.format_tree().map(|newick| (right - left, newick)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoalescenceRecord;
    use crate::trees::Provenance;

    fn sequence(records: Vec<CoalescenceRecord>, n: u32, m: u32) -> TreeSequence {
        TreeSequence::from_records(n, m, &records, Provenance::default()).unwrap()
    }

    #[test]
    fn single_pair_tree() {
        let ts = sequence(
            vec![CoalescenceRecord { left: 1, right: 2, node: 3, children: [1, 2], time: 0.25 }],
            2,
            1,
        );
        let trees: Vec<(u32, String)> =
            NewickConverter::new(&ts, 4).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(trees, vec![(1, "(1:0.2500,2:0.2500);".to_string())]);
    }

    #[test]
    fn nested_trees_with_spans() {
        let ts = sequence(
            vec![
                CoalescenceRecord { left: 1, right: 11, node: 5, children: [1, 2], time: 0.5 },
                CoalescenceRecord { left: 1, right: 11, node: 6, children: [3, 4], time: 0.8 },
                CoalescenceRecord { left: 1, right: 6, node: 7, children: [5, 6], time: 1.0 },
                CoalescenceRecord { left: 6, right: 11, node: 8, children: [5, 6], time: 1.5 },
            ],
            4,
            10,
        );
        let trees: Vec<(u32, String)> =
            NewickConverter::new(&ts, 3).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(trees.len(), 2);
        assert_eq!(
            trees[0],
            (5, "((1:0.500,2:0.500):0.500,(3:0.800,4:0.800):0.200);".to_string())
        );
        assert_eq!(
            trees[1],
            (5, "((1:0.500,2:0.500):1.000,(3:0.800,4:0.800):0.700);".to_string())
        );
    }

    #[test]
    fn precision_is_bounded() {
        let ts = sequence(
            vec![CoalescenceRecord { left: 1, right: 2, node: 3, children: [1, 2], time: 0.25 }],
            2,
            1,
        );
        assert!(matches!(NewickConverter::new(&ts, 18), Err(Error::NewickOverflow)));
        assert!(NewickConverter::new(&ts, 17).is_ok());
    }
}
