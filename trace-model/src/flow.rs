//! Flow events and the interval tree that indexes them.

use crate::args::ArgDict;
use crate::bounds::Bounds;
use crate::thread::ThreadKey;

/// Location of a synchronous slice: its thread plus its index within that
/// thread's slice group. Flow arcs store these handles instead of
/// pointers; the group vector is append-only during import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceHandle {
    pub thread: ThreadKey,
    pub index: usize,
}

/// A directed causality arc from one slice to another.
#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub id: String,
    pub category: String,
    pub title: String,
    pub color_id: u32,
    /// Producer-side timestamp, milliseconds.
    pub start: f64,
    /// Consumer-side timestamp, milliseconds.
    pub end: f64,
    pub args: ArgDict,
    pub start_slice: Option<SliceHandle>,
    pub end_slice: Option<SliceHandle>,
}

impl FlowEvent {
    pub fn shift_timestamps(&mut self, delta: f64) {
        self.start += delta;
        self.end += delta;
    }

    pub fn add_bounds(&self, bounds: &mut Bounds) {
        bounds.add_range(self.start, self.end);
    }
}

/// Static augmented interval tree over `(start, end)` ranges.
///
/// Built once during finalization from the model's flow events. The tree
/// is an implicit balanced BST over intervals sorted by start, each node
/// augmented with the maximum end of its subtree.
#[derive(Debug, Default)]
pub struct FlowIntervalTree {
    // Sorted by (start, end, item); max_end is subtree-max in the implicit
    // mid-split tree rooted at the middle element.
    nodes: Vec<IntervalNode>,
}

#[derive(Debug, Clone, Copy)]
struct IntervalNode {
    start: f64,
    end: f64,
    max_end: f64,
    item: usize,
}

impl FlowIntervalTree {
    pub fn build(entries: impl IntoIterator<Item = (f64, f64, usize)>) -> FlowIntervalTree {
        let mut nodes: Vec<IntervalNode> = entries
            .into_iter()
            .map(|(start, end, item)| IntervalNode {
                start,
                end,
                max_end: end,
                item,
            })
            .collect();
        nodes.sort_by(|a, b| {
            a.start
                .partial_cmp(&b.start)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.end
                        .partial_cmp(&b.end)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.item.cmp(&b.item))
        });
        let mut tree = FlowIntervalTree { nodes };
        if !tree.nodes.is_empty() {
            tree.augment(0, tree.nodes.len());
        }
        tree
    }

    fn augment(&mut self, lo: usize, hi: usize) -> f64 {
        let mid = lo + (hi - lo) / 2;
        let mut max_end = self.nodes[mid].end;
        if lo < mid {
            max_end = max_end.max(self.augment(lo, mid));
        }
        if mid + 1 < hi {
            max_end = max_end.max(self.augment(mid + 1, hi));
        }
        self.nodes[mid].max_end = max_end;
        max_end
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Items whose interval intersects `[lo, hi]`, in insertion order of
    /// the underlying items.
    pub fn find_intersection(&self, lo: f64, hi: f64) -> Vec<usize> {
        let mut out = Vec::new();
        if !self.nodes.is_empty() {
            self.query(0, self.nodes.len(), lo, hi, &mut out);
        }
        out.sort_unstable();
        out
    }

    fn query(&self, node_lo: usize, node_hi: usize, lo: f64, hi: f64, out: &mut Vec<usize>) {
        let mid = node_lo + (node_hi - node_lo) / 2;
        let node = self.nodes[mid];
        if node.max_end < lo {
            return;
        }
        if node_lo < mid {
            self.query(node_lo, mid, lo, hi, out);
        }
        if node.start <= hi && lo <= node.end {
            out.push(node.item);
        }
        if node.start <= hi && mid + 1 < node_hi {
            self.query(mid + 1, node_hi, lo, hi, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn intersection_queries_match_linear_scan() {
        let entries = vec![
            (0.0, 5.0, 0),
            (2.0, 3.0, 1),
            (4.0, 10.0, 2),
            (6.0, 7.0, 3),
            (11.0, 12.0, 4),
        ];
        let tree = FlowIntervalTree::build(entries.clone());
        for (lo, hi) in [(0.0, 1.0), (2.5, 4.5), (5.0, 6.0), (10.5, 11.0), (-2.0, -1.0)] {
            let expected: Vec<usize> = entries
                .iter()
                .filter(|(s, e, _)| *s <= hi && lo <= *e)
                .map(|&(_, _, i)| i)
                .collect();
            assert_eq!(tree.find_intersection(lo, hi), expected, "[{lo}, {hi}]");
        }
    }

    #[rstest]
    fn empty_tree_finds_nothing() {
        let tree = FlowIntervalTree::build(Vec::new());
        assert!(tree.is_empty());
        assert!(tree.find_intersection(0.0, 100.0).is_empty());
    }
}
