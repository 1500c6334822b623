//! Per-morpheme evaluator glue (component I): `eval()` and the top-N path
//! container it feeds.
//!
//! Grounded on `original_source/src/CoNgramModel.cpp`'s
//! `MorphemeEvaluator<CoNgramState<...>>::eval` (the candidate/prevPath
//! partitioning shape: regular vs. chunked vs. combining-left/right
//! candidates, regular vs. combining-socket prev paths, a `progressMatrix`
//! call over the regular cross product, and sequential extension for
//! chunked morphemes). Tag scoring, morphological legality of a left/right
//! combination, and lattice-node bookkeeping are all external collaborators
//! per spec.md's Non-goals ("morpheme tagging/rule scoring" stays out of
//! scope) — this module receives already-classified candidates and prev
//! paths and only ever calls into `Model::progress`/`progress_matrix` to
//! score them, per spec.md §4.H's explicit framing of `eval` as routing,
//! not tagging.

use crate::model::{Model, VocabId};
use crate::state::LmState;

/// Sentinel chunk id a caller writes into a `RegularChunked` sequence to
/// signal that is a morphologically blocked follow-on (spec.md §4.H step 4:
/// "aborting on a special 'blocked' tag"). No real vocab id uses this value
/// (spec.md's vocab ids are `< vocabSize`, bounded well below `u32::MAX`).
pub const BLOCKED_CHUNK: VocabId = VocabId::MAX;

/// One scoring hypothesis carried into `eval`, already tagged as either a
/// regular lattice edge or a combining-morpheme socket (spec.md §4.H step 2
/// partitioning).
#[derive(Debug, Clone, Copy)]
pub struct PrevPath {
    pub state: LmState,
    pub score: f32,
    pub socket: bool,
}

impl PrevPath {
    pub fn regular(state: LmState, score: f32) -> PrevPath {
        PrevPath { state, score, socket: false }
    }

    pub fn combining_socket(state: LmState, score: f32) -> PrevPath {
        PrevPath { state, score, socket: true }
    }
}

/// A morpheme candidate, already classified by the caller (spec.md §4.H
/// step 1 partitioning).
#[derive(Debug, Clone)]
pub enum Candidate {
    /// A single regular morpheme, scored against every regular prev path.
    RegularSingle(VocabId),
    /// A multi-morpheme chunk scored by sequentially calling `progress` on
    /// each follow-on id, in order, against every regular prev path.
    RegularChunked(Vec<VocabId>),
    /// A left half of a combining pair, scored against combining-socket
    /// prev paths only.
    CombiningLeft(VocabId),
    /// A right half of a combining pair, scored against combining-socket
    /// prev paths only.
    CombiningRight(VocabId),
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredPath {
    pub state: LmState,
    pub score: f32,
}

/// Keeps the single best-scoring path per [`LmState`] equivalence class
/// (spec.md §3.5 equality), ties broken by first-seen order, then returns
/// the top `n` by score. Deterministic and side-effect free so concurrent
/// callers on disjoint lattice regions never need to coordinate.
pub struct TopNPaths {
    n: usize,
    best: std::collections::HashMap<LmState, (f32, usize)>,
    next_seq: usize,
}

impl TopNPaths {
    pub fn new(n: usize) -> TopNPaths {
        TopNPaths {
            n,
            best: std::collections::HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn offer(&mut self, state: LmState, score: f32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.best
            .entry(state)
            .and_modify(|(best_score, best_seq)| {
                if score > *best_score {
                    *best_score = score;
                    *best_seq = seq;
                }
            })
            .or_insert((score, seq));
    }

    pub fn into_sorted_vec(self) -> Vec<ScoredPath> {
        let mut entries: Vec<(LmState, f32, usize)> =
            self.best.into_iter().map(|(s, (score, seq))| (s, score, seq)).collect();
        entries.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        entries.truncate(self.n);
        entries
            .into_iter()
            .map(|(state, score, _)| ScoredPath { state, score })
            .collect()
    }
}

/// Extends a lattice node's candidate morphemes over its incoming paths,
/// returning the top `top_n` scored extensions (spec.md §4.H).
pub fn eval(
    model: &Model,
    prev_paths: &[PrevPath],
    candidates: &[Candidate],
    top_n: usize,
) -> Vec<ScoredPath> {
    let regular_prev: Vec<&PrevPath> = prev_paths.iter().filter(|p| !p.socket).collect();
    let socket_prev: Vec<&PrevPath> = prev_paths.iter().filter(|p| p.socket).collect();

    let mut regular_single: Vec<VocabId> = Vec::new();
    let mut chunked: Vec<&[VocabId]> = Vec::new();
    let mut combining_left: Vec<VocabId> = Vec::new();
    let mut combining_right: Vec<VocabId> = Vec::new();
    for c in candidates {
        match c {
            Candidate::RegularSingle(id) => regular_single.push(*id),
            Candidate::RegularChunked(ids) => chunked.push(ids),
            Candidate::CombiningLeft(id) => combining_left.push(*id),
            Candidate::CombiningRight(id) => combining_right.push(*id),
        }
    }

    let mut top = TopNPaths::new(top_n);

    if !regular_prev.is_empty() && !regular_single.is_empty() {
        let prev_states: Vec<LmState> = regular_prev.iter().map(|p| p.state).collect();
        let (states, scores) = model.progress_matrix(&prev_states, &regular_single, 0);
        let n = regular_single.len();
        for (mi, p) in regular_prev.iter().enumerate() {
            for ni in 0..n {
                let idx = mi * n + ni;
                top.offer(states[idx], p.score + scores[idx]);
            }
        }
    }

    for chunk in &chunked {
        for p in &regular_prev {
            let mut state = p.state;
            let mut score = p.score;
            let mut blocked = false;
            for &wid in *chunk {
                if wid == BLOCKED_CHUNK {
                    blocked = true;
                    break;
                }
                let (next_state, ll) = model.progress(&state, wid);
                state = next_state;
                score += ll;
            }
            if !blocked {
                top.offer(state, score);
            }
        }
    }

    for &wid in combining_left.iter().chain(combining_right.iter()) {
        for p in &socket_prev {
            let (next_state, ll) = model.progress(&p.state, wid);
            top.offer(next_state, p.score + ll);
        }
    }

    top.into_sorted_vec()
}
