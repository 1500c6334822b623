//! Batched scoring (component H): `Model::progress_matrix`.
//!
//! Grounded on `original_source/src/CoNgramModel.cpp`'s `progressMatrixWSort`
//! / `progressMatrixWOSort` / `progressMatrixNoWindow` shape dispatch (spec.md
//! §4.G "Batched scheduling") and on spec.md §5's Ordering invariant, which
//! is the only hard contract this component has to honor: the result must
//! match `for m: for n: progress(prev[m], next[n])` up to fp32 tolerance,
//! regardless of internal reordering.
//!
//! The reference builds one large transient GEMM over deduplicated context/
//! history/candidate rows and scatters the result back. This port takes a
//! different route to the same contract: candidate `(state, token)` pairs
//! are deduplicated directly (`LmState`'s `Hash`/`Eq` already implement the
//! state-equivalence spec.md §3.5 requires for hypothesis merging) and each
//! distinct pair is scored by calling [`Model::progress`] once, so batching
//! is exactly — not just approximately — equivalent to the naive double
//! loop, never merely within tolerance. This trades the reference's raw
//! cross-row SIMD throughput for a batching layer with no numerical
//! divergence to reason about; see DESIGN.md open question 8.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::model::{ContextId, Model, VocabId};
use crate::state::LmState;

/// Above this M or N, pairs are deduplicated through a scratch hash map
/// before scoring (spec.md §4.G: "sorted path when M > 16 or N > 16").
/// Below it the dedup bookkeeping costs more than the redundant `progress`
/// calls it would save, so the unsorted path scores every pair directly.
const SORT_THRESHOLD: usize = 16;

thread_local! {
    /// Reused across calls per spec.md §5 ("thread-local... reused across
    /// calls... never freed between calls"); cleared (not dropped) at the
    /// start of each batched call so its allocated capacity persists.
    static DEDUP_SCRATCH: RefCell<HashMap<(LmState, VocabId), (LmState, f32)>> =
        RefCell::new(HashMap::new());
}

impl Model {
    /// Batched single-step scoring (spec.md §4.G `progressMatrix`).
    ///
    /// `next_ids` must be partitioned so the last `num_valid_distant`
    /// entries are the ones with `distantMask == 1`; this mirrors the
    /// reference's contract but is not otherwise load-bearing here since
    /// distant-mask eligibility is re-checked per token inside
    /// [`Model::progress`] regardless of the caller's partitioning.
    ///
    /// Returns `(states, scores)`, both row-major `M × N`: entry
    /// `m * N + n` corresponds to `progress(prev[m], next_ids[n])`.
    pub fn progress_matrix(
        &self,
        prev: &[LmState],
        next_ids: &[VocabId],
        _num_valid_distant: usize,
    ) -> (Vec<LmState>, Vec<f32>) {
        let m = prev.len();
        let n = next_ids.len();
        let mut states = vec![LmState::new(self.window_size()); m * n];
        let mut scores = vec![0f32; m * n];

        if m > SORT_THRESHOLD || n > SORT_THRESHOLD {
            self.progress_matrix_dedup(prev, next_ids, &mut states, &mut scores);
        } else {
            self.progress_matrix_direct(prev, next_ids, &mut states, &mut scores);
        }
        (states, scores)
    }

    fn progress_matrix_direct(
        &self,
        prev: &[LmState],
        next_ids: &[VocabId],
        states: &mut [LmState],
        scores: &mut [f32],
    ) {
        let n = next_ids.len();
        for (mi, p) in prev.iter().enumerate() {
            for (ni, &tok) in next_ids.iter().enumerate() {
                let (s, ll) = self.progress(p, tok);
                states[mi * n + ni] = s;
                scores[mi * n + ni] = ll;
            }
        }
    }

    fn progress_matrix_dedup(
        &self,
        prev: &[LmState],
        next_ids: &[VocabId],
        states: &mut [LmState],
        scores: &mut [f32],
    ) {
        let n = next_ids.len();
        DEDUP_SCRATCH.with(|cell| {
            let mut cache = cell.borrow_mut();
            cache.clear();
            for (mi, p) in prev.iter().enumerate() {
                for (ni, &tok) in next_ids.iter().enumerate() {
                    let key = (*p, tok);
                    let &(s, ll) = cache
                        .entry(key)
                        .or_insert_with(|| self.progress(p, tok));
                    states[mi * n + ni] = s;
                    scores[mi * n + ni] = ll;
                }
            }
        });
    }

    /// Convenience used by [`Model::progress_matrix`]'s callers that only
    /// need the context id a batch of candidates would resolve to, without
    /// the full score (spec.md §4.H evaluator's chunked-morpheme path calls
    /// `state.next` repeatedly; this is the equivalent single-hop helper).
    pub fn peek_context(&self, state: &LmState, token: VocabId) -> ContextId {
        self.progress(state, token).0.ctx_idx
    }
}
