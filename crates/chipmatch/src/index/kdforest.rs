//! Randomized kd-forest with best-bin-first search.
//!
//! Each tree partitions row indices of one shared descriptor matrix. Split
//! dimensions are drawn at random among the highest-variance dimensions of a
//! row sample, so trees disagree and a shared priority queue over all trees
//! explores complementary cells. Nodes live in a flat arena so the forest is
//! plain data and can be written to / read from the disk cache as-is.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::descriptor::{squared_l2, Descriptors};

/// Rows sampled per node to estimate per-dimension variance.
const VARIANCE_SAMPLE: usize = 100;
/// Split dimension is drawn among this many highest-variance dimensions.
const TOP_VARIANCE_DIMS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    /// Rows `perm[start..end]` of the owning tree.
    Leaf { start: usize, end: usize },
    /// Rows with `value < threshold` go left.
    Split {
        dim: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KdTree {
    /// Arena; the root is node 0.
    nodes: Vec<Node>,
    /// Row permutation; leaves reference contiguous slices of it.
    perm: Vec<usize>,
}

/// A set of randomized kd-trees over the same rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct KdForest {
    trees: Vec<KdTree>,
}

impl KdForest {
    /// Build `trees` trees over all rows of `data`; tree `t` is seeded with
    /// `seed + t`.
    pub(crate) fn build(data: &Descriptors, trees: usize, leaf_max_size: usize, seed: u64) -> Self {
        let trees = (0..trees.max(1))
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                KdTree::build(data, leaf_max_size.max(1), &mut rng)
            })
            .collect();
        Self { trees }
    }

    pub(crate) fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Structural check against the matrix the forest is meant to index.
    ///
    /// Every tree must hold a permutation of `0..n_rows`, reference only
    /// in-range nodes and dimensions, and tile its permutation with leaves.
    pub(crate) fn validate(&self, n_rows: usize, dim: usize) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("forest has no trees".into());
        }
        for (t, tree) in self.trees.iter().enumerate() {
            tree.validate(n_rows, dim)
                .map_err(|msg| format!("tree {t}: {msg}"))?;
        }
        Ok(())
    }

    /// `k` nearest rows to `query`, ascending by `(distance, row)`.
    ///
    /// `checks == 0` searches exhaustively (exact). Otherwise the search
    /// stops once `checks` rows have been examined and `k` results are held.
    /// Callers guarantee `k <= data.len()`.
    pub(crate) fn knn(
        &self,
        data: &Descriptors,
        query: &[u8],
        k: usize,
        checks: usize,
        scratch: &mut SearchScratch,
    ) -> Vec<(f32, usize)> {
        scratch.reset(data.len());
        let mut search = Search {
            data,
            query,
            k,
            checks,
            checked: 0,
            results: Vec::with_capacity(k + 1),
            scratch,
        };

        for (t, tree) in self.trees.iter().enumerate() {
            search.descend(tree, t, 0, 0.0);
        }
        while let Some(branch) = search.scratch.heap.pop() {
            if search.is_done() || search.cannot_improve(branch.bound) {
                break;
            }
            search.descend(&self.trees[branch.tree], branch.tree, branch.node, branch.bound);
        }
        search.results
    }
}

impl KdTree {
    fn build(data: &Descriptors, leaf_max_size: usize, rng: &mut StdRng) -> Self {
        let n = data.len();
        let mut perm: Vec<usize> = (0..n).collect();
        let mut nodes = vec![Node::Leaf { start: 0, end: n }];
        let mut stack = vec![(0usize, 0usize, n)];

        while let Some((node, lo, hi)) = stack.pop() {
            if hi - lo <= leaf_max_size {
                nodes[node] = Node::Leaf { start: lo, end: hi };
                continue;
            }
            let Some((dim, threshold)) = choose_split(data, &perm[lo..hi], rng) else {
                nodes[node] = Node::Leaf { start: lo, end: hi };
                continue;
            };
            let mid = lo + partition(&mut perm[lo..hi], |row| {
                (data.row(row)[dim] as f32) < threshold
            });
            if mid == lo || mid == hi {
                // Sample was unrepresentative; keep the cell whole.
                nodes[node] = Node::Leaf { start: lo, end: hi };
                continue;
            }
            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf { start: lo, end: mid });
            nodes.push(Node::Leaf { start: mid, end: hi });
            nodes[node] = Node::Split {
                dim,
                threshold,
                left,
                right,
            };
            stack.push((right, mid, hi));
            stack.push((left, lo, mid));
        }

        Self { nodes, perm }
    }

    fn validate(&self, n_rows: usize, dim: usize) -> Result<(), String> {
        if self.perm.len() != n_rows {
            return Err(format!(
                "permutation holds {} rows, expected {n_rows}",
                self.perm.len()
            ));
        }
        let mut seen = vec![false; n_rows];
        for &row in &self.perm {
            if row >= n_rows || std::mem::replace(&mut seen[row], true) {
                return Err(format!("leaf row {row} out of range or repeated"));
            }
        }
        if self.nodes.is_empty() {
            return Err("empty node arena".into());
        }
        let mut covered = 0usize;
        for (idx, node) in self.nodes.iter().enumerate() {
            match *node {
                Node::Leaf { start, end } => {
                    if start > end || end > n_rows {
                        return Err(format!("leaf range {start}..{end} out of bounds"));
                    }
                    covered += end - start;
                }
                Node::Split {
                    dim: d,
                    threshold,
                    left,
                    right,
                } => {
                    if d >= dim || !threshold.is_finite() {
                        return Err(format!("bad split on dimension {d}"));
                    }
                    // Children are pushed after their parent, so a valid arena
                    // only points forward. Anything else could cycle.
                    if left >= self.nodes.len() || right >= self.nodes.len() || left <= idx || right <= idx
                    {
                        return Err(format!("node {idx}: child index {left}/{right} out of order"));
                    }
                }
            }
        }
        if covered != n_rows {
            return Err(format!("leaves cover {covered} rows, expected {n_rows}"));
        }
        Ok(())
    }
}

/// Pick a split dimension among the top-variance dimensions of a row sample
/// and use the sample mean as threshold. `None` when the sample is constant.
fn choose_split(data: &Descriptors, rows: &[usize], rng: &mut StdRng) -> Option<(usize, f32)> {
    let dim = data.dim();
    let n_sample = rows.len().min(VARIANCE_SAMPLE);
    let sample: Vec<usize> = if rows.len() > VARIANCE_SAMPLE {
        rand::seq::index::sample(rng, rows.len(), n_sample)
            .iter()
            .map(|i| rows[i])
            .collect()
    } else {
        rows.to_vec()
    };

    let mut mean = vec![0.0f64; dim];
    for &row in &sample {
        for (m, &v) in mean.iter_mut().zip(data.row(row)) {
            *m += v as f64;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n_sample as f64);

    let mut var = vec![0.0f64; dim];
    for &row in &sample {
        for ((s, &v), m) in var.iter_mut().zip(data.row(row)).zip(&mean) {
            let d = v as f64 - m;
            *s += d * d;
        }
    }

    let mut order: Vec<usize> = (0..dim).filter(|&d| var[d] > 0.0).collect();
    if order.is_empty() {
        return None;
    }
    order.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
    order.truncate(TOP_VARIANCE_DIMS);
    let split_dim = order[rng.gen_range(0..order.len())];
    Some((split_dim, mean[split_dim] as f32))
}

/// In-place partition; returns the number of elements satisfying `pred`,
/// which end up in front.
fn partition(rows: &mut [usize], pred: impl Fn(usize) -> bool) -> usize {
    let mut front = 0;
    for i in 0..rows.len() {
        if pred(rows[i]) {
            rows.swap(front, i);
            front += 1;
        }
    }
    front
}

/// Unexplored subtree with a lower bound on the squared distance of any of
/// its rows to the query.
#[derive(Debug, Clone, Copy)]
struct Branch {
    bound: f32,
    tree: usize,
    node: usize,
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap; tie-break on (tree, node) so pops are deterministic.
        other
            .bound
            .total_cmp(&self.bound)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

/// Reusable per-query buffers; one instance serves a whole batch of queries.
#[derive(Debug, Default)]
pub(crate) struct SearchScratch {
    visited: Vec<bool>,
    touched: Vec<usize>,
    heap: BinaryHeap<Branch>,
}

impl SearchScratch {
    fn reset(&mut self, n_rows: usize) {
        if self.visited.len() != n_rows {
            self.visited = vec![false; n_rows];
        } else {
            for &row in &self.touched {
                self.visited[row] = false;
            }
        }
        self.touched.clear();
        self.heap.clear();
    }
}

struct Search<'a> {
    data: &'a Descriptors,
    query: &'a [u8],
    k: usize,
    checks: usize,
    checked: usize,
    /// Sorted ascending by `(distance, row)`, at most `k` long.
    results: Vec<(f32, usize)>,
    scratch: &'a mut SearchScratch,
}

impl Search<'_> {
    #[inline]
    fn is_full(&self) -> bool {
        self.results.len() >= self.k
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.checks > 0 && self.checked >= self.checks && self.is_full()
    }

    /// A subtree whose bound exceeds the current worst result holds nothing
    /// better. Equal bounds may still hold a smaller row index.
    #[inline]
    fn cannot_improve(&self, bound: f32) -> bool {
        self.is_full() && self.results.last().is_some_and(|&(worst, _)| bound > worst)
    }

    fn descend(&mut self, tree: &KdTree, tree_idx: usize, mut node: usize, bound: f32) {
        loop {
            match tree.nodes[node] {
                Node::Split {
                    dim,
                    threshold,
                    left,
                    right,
                } => {
                    let diff = self.query[dim] as f32 - threshold;
                    let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                    let far_bound = bound.max(diff * diff);
                    if !self.cannot_improve(far_bound) {
                        self.scratch.heap.push(Branch {
                            bound: far_bound,
                            tree: tree_idx,
                            node: far,
                        });
                    }
                    node = near;
                }
                Node::Leaf { start, end } => {
                    for &row in &tree.perm[start..end] {
                        if self.is_done() {
                            return;
                        }
                        if std::mem::replace(&mut self.scratch.visited[row], true) {
                            continue;
                        }
                        self.scratch.touched.push(row);
                        self.checked += 1;
                        let dist = squared_l2(self.query, self.data.row(row));
                        self.offer(dist, row);
                    }
                    return;
                }
            }
        }
    }

    fn offer(&mut self, dist: f32, row: usize) {
        let key = (dist, row);
        let less = |a: &(f32, usize), b: &(f32, usize)| {
            a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)) == Ordering::Less
        };
        if self.is_full() && !self.results.last().is_some_and(|worst| less(&key, worst)) {
            return;
        }
        let pos = self.results.partition_point(|probe| less(probe, &key));
        self.results.insert(pos, key);
        self.results.truncate(self.k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::random_descriptors;

    fn brute_force(data: &Descriptors, query: &[u8], k: usize) -> Vec<(f32, usize)> {
        let mut all: Vec<(f32, usize)> = data
            .rows()
            .enumerate()
            .map(|(row, d)| (squared_l2(query, d), row))
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.truncate(k);
        all
    }

    #[test]
    fn exhaustive_search_matches_brute_force() {
        let data = random_descriptors(400, 16, 3);
        let queries = random_descriptors(25, 16, 4);
        let forest = KdForest::build(&data, 4, 8, 42);
        let mut scratch = SearchScratch::default();
        for q in queries.rows() {
            assert_eq!(forest.knn(&data, q, 5, 0, &mut scratch), brute_force(&data, q, 5));
        }
    }

    #[test]
    fn bounded_search_returns_k_sorted_unique_rows() {
        let data = random_descriptors(500, 32, 11);
        let forest = KdForest::build(&data, 2, 10, 7);
        let mut scratch = SearchScratch::default();
        let out = forest.knn(&data, data.row(17), 6, 16, &mut scratch);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], (0.0, 17));
        assert!(out.windows(2).all(|w| (w[0].0, w[0].1) < (w[1].0, w[1].1)));
    }

    #[test]
    fn equal_distances_break_ties_by_row() {
        let data = Descriptors::from_rows(&[[5u8, 5], [1, 1], [5, 5], [5, 5]]).unwrap();
        let forest = KdForest::build(&data, 3, 1, 0);
        let mut scratch = SearchScratch::default();
        let out = forest.knn(&data, &[5, 5], 3, 0, &mut scratch);
        assert_eq!(out, vec![(0.0, 0), (0.0, 2), (0.0, 3)]);
    }

    #[test]
    fn build_is_reproducible_and_valid() {
        let data = random_descriptors(300, 8, 5);
        let a = KdForest::build(&data, 3, 4, 99);
        let b = KdForest::build(&data, 3, 4, 99);
        assert_eq!(a, b);
        assert_eq!(a.n_trees(), 3);
        a.validate(300, 8).expect("valid forest");
        assert!(a.validate(301, 8).is_err());
    }

    #[test]
    fn backward_child_links_are_rejected() {
        let data = random_descriptors(200, 8, 6);
        let built = KdForest::build(&data, 1, 4, 3);
        let splits: Vec<usize> = built.trees[0]
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n, Node::Split { .. }))
            .map(|(i, _)| i)
            .collect();
        assert!(splits.len() > 1);

        // A split pointing at itself.
        let mut forest = built.clone();
        let deepest = splits[splits.len() - 1];
        if let Node::Split { left, .. } = &mut forest.trees[0].nodes[deepest] {
            *left = deepest;
        }
        assert!(forest.validate(200, 8).is_err());

        // A split pointing back at an ancestor.
        let mut forest = built;
        if let Node::Split { right, .. } = &mut forest.trees[0].nodes[splits[1]] {
            *right = 0;
        }
        assert!(forest.validate(200, 8).is_err());
    }

    #[test]
    fn constant_rows_collapse_into_one_leaf() {
        let data = Descriptors::from_flat(4, vec![9; 4 * 50]).unwrap();
        let forest = KdForest::build(&data, 1, 4, 0);
        assert_eq!(forest.trees[0].nodes.len(), 1);
        forest.validate(50, 4).expect("single leaf covers all rows");
    }
}
