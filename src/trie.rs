//! Context trie (component F): a suffix-trie over morpheme n-gram
//! histories with fail-links ("lower" deltas), built once from the
//! StreamVByte-decoded node/key/value streams and then read-only.
//!
//! Grounded on `original_source/src/CoNgramModel.cpp`'s `CoNgramModel`
//! constructor (the stack-of-`keyRanges` decode of the implicit node-size
//! stream into a flat node/edge arena) and its fail-link BFS (`findLowerNode`
//! / `findLowerValue`, and the `Deque<MyNode*> dq` loop that walks the trie
//! breadth-first assigning `child->lower`). `progressContextNodeVl` and the
//! split-key handling in `progressContextNode` are ported transition-for-
//! transition; see spec.md §4.F for the prose this mirrors.

use std::collections::VecDeque;

use crate::error::{ModelError, Result};

/// Reserved split point: `keySize == 2` labels in `[T_MAX, 65536)` encode a
/// two-hop high/low pair instead of a direct transition (spec.md §4.F,
/// §9 "Split-key high/low encoding").
const T_MAX: u32 = (1 << 16) - (1 << 10) * 2;

#[derive(Debug, Clone, Copy)]
struct Node {
    value: u32,
    num_nexts: u32,
    edge_start: u32,
    lower: i32,
}

pub struct Trie {
    nodes: Vec<Node>,
    labels: Vec<u32>,
    deltas: Vec<i32>,
    /// `ContextId[vocabSize]` direct lookup table for root transitions
    /// (spec.md §3.2): positive = absolute child node index, negative =
    /// `-leafContextId`, zero = unknown.
    root_table: Vec<i32>,
    key_size: u8,
}

/// Pops any range(s) at the top of the stack whose write cursor has reached
/// its end, bubbling the completion into the new top's cursor exactly as the
/// leaf branch of the decode loop does.
fn close_completed_ranges(key_ranges: &mut Vec<(usize, usize, usize)>) {
    while key_ranges.last().map(|&(_, c, e)| c == e).unwrap_or(false) {
        key_ranges.pop();
        if let Some(back) = key_ranges.last_mut() {
            back.1 += 1;
        } else {
            break;
        }
    }
}

impl Trie {
    /// Builds the trie from decoded node-size / label / value streams.
    /// `node_sizes.len() == num_nodes`, `labels.len() == num_nodes - 1`,
    /// `values.len() == num_nodes`.
    pub fn build(
        node_sizes: &[u32],
        edge_labels: &[u32],
        values: &[u32],
        vocab_size: u32,
        key_size: u8,
    ) -> Result<Trie> {
        let num_nodes = node_sizes.len();
        if num_nodes == 0 {
            return Err(ModelError::CorruptModel("empty node stream".to_string()));
        }
        if edge_labels.len() != num_nodes.saturating_sub(1) || values.len() != num_nodes {
            return Err(ModelError::CorruptModel(
                "node/key/value stream length mismatch".to_string(),
            ));
        }

        let num_non_leaf = 1 + node_sizes.iter().skip(1).filter(|&&s| s != 0).count();
        let mut nodes: Vec<Node> = Vec::with_capacity(num_non_leaf);
        let mut deltas: Vec<i32> = vec![0; num_nodes - 1];
        // (node index owning this range, write cursor, end) — mirrors the
        // `keyRanges` stack in the reference decoder.
        let mut key_ranges: Vec<(usize, usize, usize)> = Vec::new();
        let mut next_offset: usize = 0;

        // Root (i == 0) is always materialized as a real node even when
        // `node_sizes[0] == 0` (the empty-trie edge case, spec.md §8.3
        // scenario 1): every other node treats size 0 as "leaf, no node of
        // its own", but node 0 is the universal entry point and must exist
        // regardless. The reference decoder doesn't need this special case
        // because a trained model's root always has at least one edge; a
        // from-scratch root with zero edges is UB there (`keyRanges.back()`
        // on an empty stack).
        for i in 0..num_nodes {
            if i == 0 || node_sizes[i] != 0 {
                let nonleaf_idx = nodes.len();
                if let Some(&(owner, cursor, _)) = key_ranges.last() {
                    if cursor >= deltas.len() {
                        return Err(ModelError::CorruptModel("edge cursor overrun".to_string()));
                    }
                    deltas[cursor] = nonleaf_idx as i32 - owner as i32;
                }
                nodes.push(Node {
                    value: values[i],
                    num_nexts: node_sizes[i],
                    edge_start: next_offset as u32,
                    lower: 0,
                });
                key_ranges.push((nonleaf_idx, next_offset, next_offset + node_sizes[i] as usize));
                next_offset += node_sizes[i] as usize;
                close_completed_ranges(&mut key_ranges);
            } else {
                let back = key_ranges
                    .last_mut()
                    .ok_or_else(|| ModelError::CorruptModel("leaf with no open parent".to_string()))?;
                if back.1 >= back.2 {
                    return Err(ModelError::CorruptModel("edge cursor overrun".to_string()));
                }
                deltas[back.1] = -(values[i] as i32);
                back.1 += 1;
                close_completed_ranges(&mut key_ranges);
            }
        }
        if !key_ranges.is_empty() {
            return Err(ModelError::CorruptModel(
                "node stream did not close all edge ranges".to_string(),
            ));
        }

        let root_num_nexts = nodes[0].num_nexts as usize;
        let mut root_table = vec![0i32; vocab_size as usize];
        for e in 0..root_num_nexts {
            let label = edge_labels[e];
            if (label as usize) < root_table.len() {
                root_table[label as usize] = deltas[e];
            }
        }

        let mut trie = Trie {
            nodes,
            labels: edge_labels.to_vec(),
            deltas,
            root_table,
            key_size,
        };
        trie.build_fail_links()?;
        Ok(trie)
    }

    fn edges(&self, node_idx: usize) -> (u32, u32) {
        let n = &self.nodes[node_idx];
        (n.edge_start, n.num_nexts)
    }

    /// Linear scan over a node's edge table for `label`; SIMD-assisted in
    /// the reference (spec.md §4.F step 2), scalar here (see DESIGN.md
    /// open question 1 for the same fallback rationale as the GEMM kernels).
    fn search_edge(&self, edge_start: u32, num_nexts: u32, label: u32) -> Option<i32> {
        let start = edge_start as usize;
        let end = start + num_nexts as usize;
        for p in start..end {
            if self.labels[p] == label {
                return Some(self.deltas[p]);
            }
        }
        None
    }

    fn find_lower_node(&self, parent_idx: usize, label: u32) -> usize {
        let mut node_idx = parent_idx;
        loop {
            let lower = self.nodes[node_idx].lower;
            if lower == 0 {
                return node_idx;
            }
            let lower_idx = (node_idx as i32 + lower) as usize;
            let (es, nn) = self.edges(lower_idx);
            if let Some(found) = self.search_edge(es, nn, label) {
                if found > 0 {
                    return (lower_idx as i32 + found) as usize;
                }
            }
            node_idx = lower_idx;
        }
    }

    fn find_lower_value(&self, parent_idx: usize, label: u32) -> u32 {
        let mut node_idx = parent_idx;
        loop {
            let lower = self.nodes[node_idx].lower;
            if lower == 0 {
                return self.nodes[node_idx].value;
            }
            let lower_idx = (node_idx as i32 + lower) as usize;
            let (es, nn) = self.edges(lower_idx);
            if let Some(found) = self.search_edge(es, nn, label) {
                if found != 0 {
                    if found > 0 {
                        return self.nodes[(lower_idx as i32 + found) as usize].value;
                    }
                    return (-found) as u32;
                }
            }
            node_idx = lower_idx;
        }
    }

    fn build_fail_links(&mut self) -> Result<()> {
        let mut queue: VecDeque<usize> = VecDeque::new();
        queue.push_back(0);
        let mut visited = vec![false; self.nodes.len()];
        visited[0] = true;
        while let Some(p_idx) = queue.pop_front() {
            let (edge_start, num_nexts) = self.edges(p_idx);
            for e in 0..num_nexts {
                let pos = (edge_start + e) as usize;
                let label = self.labels[pos];
                let delta = self.deltas[pos];
                if delta <= 0 {
                    continue;
                }
                let child_idx = (p_idx as i32 + delta) as usize;
                if child_idx >= self.nodes.len() {
                    return Err(ModelError::CorruptModel("childDelta out of range".to_string()));
                }
                if visited[child_idx] {
                    return Err(ModelError::CorruptModel("cycle in trie edges".to_string()));
                }
                visited[child_idx] = true;
                let lower_abs = self.find_lower_node(p_idx, label);
                self.nodes[child_idx].lower = lower_abs as i32 - child_idx as i32;
                if self.nodes[child_idx].value == 0 {
                    self.nodes[child_idx].value = self.find_lower_value(p_idx, label);
                }
                queue.push_back(child_idx);
            }
        }
        if visited.iter().any(|&v| !v) {
            return Err(ModelError::CorruptModel(
                "unreachable node in trie arena".to_string(),
            ));
        }
        Ok(())
    }

    fn progress_vl(&self, node_idx: &mut i32, next: u32) -> u32 {
        loop {
            let idx = *node_idx as usize;
            let v: i32;
            if idx != 0 {
                let (es, nn) = self.edges(idx);
                match self.search_edge(es, nn, next) {
                    Some(found) => v = found,
                    None => {
                        let lower = self.nodes[idx].lower;
                        if lower == 0 {
                            return 0;
                        }
                        *node_idx = idx as i32 + lower;
                        continue;
                    }
                }
            } else {
                v = self.root_table.get(next as usize).copied().unwrap_or(0);
                if v == 0 {
                    return 0;
                }
            }

            if v > 0 {
                let child = idx as i32 + v;
                *node_idx = child;
                return self.nodes[child as usize].value;
            }

            // leaf hit: keep walking the fail-link chain of `idx` looking for
            // a longer (non-leaf) match under the same label.
            let mut cur = idx;
            loop {
                if self.nodes[cur].lower == 0 {
                    *node_idx = 0;
                    return (-v) as u32;
                }
                cur = (cur as i32 + self.nodes[cur].lower) as usize;
                if cur != 0 {
                    let (es, nn) = self.edges(cur);
                    if let Some(lv) = self.search_edge(es, nn, next) {
                        if lv > 0 {
                            cur = (cur as i32 + lv) as usize;
                            *node_idx = cur as i32;
                            return (-v) as u32;
                        }
                    }
                } else if let Some(&lv) = self.root_table.get(next as usize) {
                    if lv > 0 {
                        *node_idx = lv;
                        return (-v) as u32;
                    }
                }
            }
        }
    }

    /// Advances `node_idx` in place by one token and returns its context id
    /// (0 if unknown), transparently issuing the two-hop split-key encoding
    /// for `keySize == 2` tokens that don't fit the 16-bit-minus-reserved
    /// range (spec.md §4.F edge case).
    pub fn progress(&self, node_idx: &mut i32, token: u32) -> u32 {
        if self.key_size != 2 || token < T_MAX {
            return self.progress_vl(node_idx, token);
        }
        let rest = token - T_MAX;
        let high = rest >> 10;
        let low = rest & 0x3FF;
        self.progress_vl(node_idx, T_MAX + high);
        self.progress_vl(node_idx, T_MAX + (1 << 10) + low)
    }

    /// Walks from root applying each id in sequence; returns the final
    /// context id (spec.md §4.G `toContextId`).
    pub fn to_context_id(&self, vocab_ids: &[u32]) -> u32 {
        let mut node_idx = 0i32;
        let mut ctx = 0u32;
        for &id in vocab_ids {
            ctx = self.progress(&mut node_idx, id);
        }
        ctx
    }

    /// Inverse of build: for each context id, every distinct root-to-node
    /// (or root-to-leaf) path that resolves to it (spec.md §4.G
    /// `getContextWordMap`).
    pub fn context_word_map(&self, context_size: usize) -> Vec<Vec<Vec<u32>>> {
        let mut out: Vec<Vec<Vec<u32>>> = vec![Vec::new(); context_size];
        let mut stack: Vec<(usize, Vec<u32>)> = vec![(0, Vec::new())];
        while let Some((node_idx, path)) = stack.pop() {
            let (es, nn) = self.edges(node_idx);
            for e in 0..nn {
                let pos = (es + e) as usize;
                let label = self.labels[pos];
                let delta = self.deltas[pos];
                let mut child_path = path.clone();
                child_path.push(label);
                if delta > 0 {
                    let child_idx = (node_idx as i32 + delta) as usize;
                    let ctx = self.nodes[child_idx].value as usize;
                    if ctx != 0 && ctx < out.len() {
                        out[ctx].push(child_path.clone());
                    }
                    stack.push((child_idx, child_path));
                } else {
                    let ctx = (-delta) as usize;
                    if ctx != 0 && ctx < out.len() {
                        out[ctx].push(child_path);
                    }
                }
            }
        }
        out
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the two-entry trie of spec.md §8.3 scenarios 2/3:
    /// `{[2,5] -> 17, [5] -> 19}`, W = 0, vocabSize = 8.
    ///
    /// Node stream (pre-order, stack-decoded): root(2 edges: label2->nonleaf,
    /// label5->leaf19), then node "2"(1 edge: label5->leaf17).
    fn sample_trie() -> Trie {
        // Pre-order node-size stream: root (2 edges: label 2 -> an internal
        // node, label 5 -> a leaf), then that internal node's own edge
        // (label 5 -> a leaf). The two leaves contribute nodeSizes entries
        // of 0 in stream order (node1's leaf is visited before root's,
        // since decoding follows root's first edge depth-first before its
        // second): i=0 root(2), i=1 node-for-label2(1), i=2 node1's
        // leaf(label5->17), i=3 root's second leaf(label5->19).
        let node_sizes = [2u32, 1u32, 0u32, 0u32];
        let edge_labels = [2u32, 5u32, 5u32];
        let values = [0u32, 0u32, 17u32, 19u32];
        Trie::build(&node_sizes, &edge_labels, &values, 8, 2).unwrap()
    }

    #[test]
    fn empty_trie_progress_returns_zero() {
        // scenario 1: only root, vocabSize = 8
        let trie = Trie::build(&[0u32], &[], &[0u32], 8, 2).unwrap();
        let mut node_idx = 0i32;
        let ctx = trie.progress(&mut node_idx, 3);
        assert_eq!(ctx, 0);
        assert_eq!(node_idx, 0);
    }

    #[test]
    fn scenario_2_direct_path_reaches_leaf17() {
        let trie = sample_trie();
        let mut node_idx = 0i32;
        let c1 = trie.progress(&mut node_idx, 2);
        assert_eq!(c1, 0); // node 1 has no own value (inherits from fail-link = root = 0)
        let c2 = trie.progress(&mut node_idx, 5);
        assert_eq!(c2, 17);
    }

    #[test]
    fn scenario_3_bad_prefix_recovers_via_fail_link() {
        let trie = sample_trie();
        let mut node_idx = 0i32;
        let c1 = trie.progress(&mut node_idx, 9); // unknown at root
        assert_eq!(c1, 0);
        assert_eq!(node_idx, 0);
        let c2 = trie.progress(&mut node_idx, 5); // root's own edge label5 -> leaf 19
        assert_eq!(c2, 19);
    }

    #[test]
    fn to_context_id_matches_progress_sequence() {
        let trie = sample_trie();
        assert_eq!(trie.to_context_id(&[2, 5]), 17);
        assert_eq!(trie.to_context_id(&[9, 5]), 19);
    }

    #[test]
    fn fail_link_bfs_reaches_every_node() {
        let trie = sample_trie();
        assert_eq!(trie.num_nodes(), 2);
    }
}
