//! Contextual n-gram language-model runtime: loads a memory-mapped,
//! read-only scoring model and evaluates morpheme lattice hypotheses
//! against it. No training, no CLI, no persisted state beyond the model
//! file itself — see `DESIGN.md` for the grounding ledger.

pub mod bitio;
pub mod error;
pub mod evaluator;
pub mod gemm;
pub mod header;
pub mod mathx;
pub mod model;
pub mod progress_matrix;
pub mod quant;
pub mod state;
pub mod trie;

pub use error::{ModelError, Result};
pub use evaluator::{eval, Candidate, PrevPath, ScoredPath, TopNPaths, BLOCKED_CHUNK};
pub use model::{ContextId, Model, VocabId};
pub use state::LmState;
