//! Math primitives (component D): numerically stable log-sum-exp and
//! log-softmax, plus the transposed 8-wide variants used by the batched
//! progress matrix (component H).
//!
//! Grounded on `original_source/src/MathFunc.hpp`. The reference dispatches
//! over SIMD packet width at compile time (`BestArchType<archType,size>`);
//! here the scalar formula is the single source of truth the GEMM module's
//! arch dispatch eventually calls into, since spec.md tolerates ULP-level
//! differences in `exp`/`log` (spec.md §1 Non-goals).

use crate::error::{ModelError, Result};

/// Sentinel for an empty distant-history slot (spec.md §9): its softmax
/// weight underflows to 0 without a branch.
pub const EMPTY_SLOT_SENTINEL: f32 = -99999.0;

/// `log(sum(exp(v)))`, numerically stable via max-subtraction.
pub fn log_sum_exp(v: &[f32]) -> f32 {
    let max = v.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = v.iter().map(|&x| (x - max).exp()).sum();
    sum.ln() + max
}

/// `v <- v - log_sum_exp(v)` in place.
pub fn log_softmax(v: &mut [f32]) {
    let ll = log_sum_exp(v);
    for x in v.iter_mut() {
        *x -= ll;
    }
}

/// Sized variants required by spec.md §4.D: only `size` 8 and 16 are
/// supported; anything else is a programmer bug (`UnsupportedSizeError`).
pub fn log_sum_exp_sized(v: &[f32]) -> Result<f32> {
    match v.len() {
        8 | 16 => Ok(log_sum_exp(v)),
        n => Err(ModelError::UnsupportedSize { size: n }),
    }
}

pub fn log_softmax_sized(v: &mut [f32]) -> Result<()> {
    match v.len() {
        8 | 16 => {
            log_softmax(v);
            Ok(())
        }
        n => Err(ModelError::UnsupportedSize { size: n }),
    }
}

/// Column-wise log-sum-exp over an 8-row block: for each of `batch_size`
/// columns strided by `stride`, replaces the first row's entry with the
/// log-sum-exp of the 8 rows in that column. Required for
/// `progressMatrix`'s result-assembly loop (spec.md §4.G, "Batched
/// scheduling").
///
/// `arr` is laid out row-major: row `r`, column `c` lives at
/// `arr[r * stride + c]`; `stride` must be at least `batch_size`.
pub fn log_sum_exp_transposed(arr: &mut [f32], batch_size: usize, stride: usize) -> Result<()> {
    const K: usize = 8;
    if (K - 1) * stride + batch_size > arr.len() {
        return Err(ModelError::UnsupportedSize { size: 0 });
    }
    for c in 0..batch_size {
        let mut max = f32::NEG_INFINITY;
        for r in 0..K {
            max = max.max(arr[r * stride + c]);
        }
        let mut sum = 0f32;
        for r in 0..K {
            sum += (arr[r * stride + c] - max).exp();
        }
        arr[c] = sum.ln() + max;
    }
    Ok(())
}

/// Column-wise log-softmax over an 8-row block: every row in each column is
/// replaced with its log-softmax value (used to turn `positionConfidence +
/// distantConfid(...)` mixture logits into log-space weights). Same layout
/// as [`log_sum_exp_transposed`].
pub fn log_softmax_transposed(arr: &mut [f32], batch_size: usize, stride: usize) -> Result<()> {
    const K: usize = 8;
    if (K - 1) * stride + batch_size > arr.len() {
        return Err(ModelError::UnsupportedSize { size: 0 });
    }
    for c in 0..batch_size {
        let mut max = f32::NEG_INFINITY;
        for r in 0..K {
            max = max.max(arr[r * stride + c]);
        }
        let mut sum = 0f32;
        for r in 0..K {
            sum += (arr[r * stride + c] - max).exp();
        }
        let ll = sum.ln() + max;
        for r in 0..K {
            arr[r * stride + c] -= ll;
        }
    }
    Ok(())
}
