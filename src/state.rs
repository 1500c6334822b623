//! Runtime LM state (spec.md §3.5): a trie node index, a context id, and
//! (when the model was built with `windowSize > 0`) a small ring of recently
//! seen "distant" tokens.
//!
//! Grounded on `original_source/src/CoNgramModel.hpp`'s `CoNgramState<windowSize,
//! ...>` template and its `operator==`/`Hash` specializations, which compare
//! only the tail of `history` (`cmpStart = windowSize / 2`) so that
//! hypotheses whose far history has diverged beyond usefulness still merge
//! in the search's top-N container.

use std::hash::{Hash, Hasher};

/// Maximum supported window size (spec.md §6.1: `windowSize` is 0 or 7).
pub const MAX_WINDOW: usize = 7;

#[derive(Debug, Clone, Copy)]
pub struct LmState {
    pub node: i32,
    pub ctx_idx: u32,
    window_size: u8,
    /// Only `history[..=window_size]` is meaningful.
    history: [u32; MAX_WINDOW + 1],
}

impl LmState {
    pub fn new(window_size: u8) -> LmState {
        debug_assert!(window_size == 0 || window_size as usize == MAX_WINDOW);
        LmState {
            node: 0,
            ctx_idx: 0,
            window_size,
            history: [0; MAX_WINDOW + 1],
        }
    }

    /// Construct a partially-initialized state carrying only a node index,
    /// mirroring `CoNgramState(int32_t _node)` in the reference, used while
    /// walking fail-link chains before a full state is needed.
    pub fn from_node(node: i32, window_size: u8) -> LmState {
        let mut s = LmState::new(window_size);
        s.node = node;
        s
    }

    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// The distant slots consulted by scoring *before* this step's token is
    /// folded in: `history[0..window_size]`.
    pub fn distant_slots(&self) -> &[u32] {
        &self.history[..self.window_size as usize]
    }

    /// Records `value` (0 if the incoming token isn't distant-mask-eligible)
    /// in the last ring slot, per spec.md §4.G: "history is rotated left by
    /// one if full; `history[W] ← (t if distantMask[t] else 0)`". The ring
    /// only shifts when the slot it's about to overwrite was non-empty —
    /// overwriting an already-empty slot in place is equivalent to shifting
    /// zeroes and skipping the memmove is cheaper (`original_source/src/
    /// CoNgramModel.cpp`'s `progress`: `if (history[windowSize]) { shift }`).
    pub fn push_distant(&mut self, value: u32) {
        let w = self.window_size as usize;
        if w == 0 {
            return;
        }
        if self.history[w] != 0 {
            self.history.copy_within(1..=w, 0);
        }
        self.history[w] = value;
    }
}

impl PartialEq for LmState {
    fn eq(&self, other: &Self) -> bool {
        if self.node != other.node {
            return false;
        }
        if self.window_size == 0 {
            return true;
        }
        let cmp_start = self.window_size as usize / 2;
        let w = self.window_size as usize;
        self.history[cmp_start..w] == other.history[cmp_start..w]
    }
}

impl Eq for LmState {}

impl Hash for LmState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        if self.window_size > 0 {
            let cmp_start = self.window_size as usize / 2;
            let w = self.window_size as usize;
            self.history[cmp_start..w].hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowless_states_compare_by_node_only() {
        let mut a = LmState::new(0);
        let mut b = LmState::new(0);
        a.node = 5;
        b.node = 5;
        assert_eq!(a, b);
        a.push_distant(42); // no-op, window_size == 0
        assert_eq!(a, b);
    }

    #[test]
    fn windowed_states_ignore_leading_half_of_history() {
        let mut a = LmState::new(7);
        let mut b = LmState::new(7);
        a.node = 3;
        b.node = 3;
        a.history[0] = 111;
        b.history[0] = 222; // differs in the ignored prefix (cmpStart = 3)
        for i in 3..=7 {
            a.history[i] = i as u32;
            b.history[i] = i as u32;
        }
        b.history[7] = 999; // newest ring slot is also excluded from comparison
        assert_eq!(a, b);

        b.history[6] = 999; // differs within the compared tail
        assert_ne!(a, b);
    }

    #[test]
    fn push_distant_rotates_left() {
        let mut s = LmState::new(7);
        for i in 0..7 {
            s.push_distant(i + 1);
        }
        // after 7 pushes from empty, the newest value (7) sits in the last
        // slot (history[W]) and hasn't yet entered the distant-scoring
        // window (history[0..W]); one more push shifts it in.
        assert_eq!(s.distant_slots(), &[0, 1, 2, 3, 4, 5, 6]);
        s.push_distant(8);
        assert_eq!(s.distant_slots(), &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn push_distant_skips_shift_when_slot_was_empty() {
        let mut s = LmState::new(7);
        s.push_distant(5); // old last slot was 0: no shift, just write
        assert_eq!(s.distant_slots(), &[0, 0, 0, 0, 0, 0, 0]);
        s.push_distant(7); // old last slot (5) was non-zero: shift then write
        assert_eq!(s.distant_slots(), &[0, 0, 0, 0, 0, 0, 5]);
        s.push_distant(0); // non-distant token: still shifts (old slot was 7)
        assert_eq!(s.distant_slots(), &[0, 0, 0, 0, 0, 5, 7]);
        s.push_distant(9); // old last slot now 0: no shift again
        assert_eq!(s.distant_slots(), &[0, 0, 0, 0, 0, 5, 7]);
    }
}
