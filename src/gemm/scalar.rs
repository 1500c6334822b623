//! Portable scalar reference kernels (`Arch::None`/`Arch::Balanced`).
//! Every other arch tag that the host can't service falls back here
//! (SPEC_FULL.md §4.E); this file is therefore the numerical ground truth
//! every other kernel must match within the tolerances of spec.md §4.E/§8.

/// Exact integer dot product of two signed int8 rows.
pub fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x as i32 * y as i32).sum()
}

/// Exact integer dot product of an unsigned-shifted row against a signed
/// int8 row (the VNNI-style `u8 x i8 -> i32` op); caller is responsible for
/// subtracting the `hsum` correction (quant::precompute_hsum).
pub fn dot_u8_i8(a: &[u8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as i32 * y as i32)
        .sum()
}

pub fn inv_norm_i8(row: &[i8]) -> f32 {
    let sumsq: i64 = row.iter().map(|&v| (v as i64) * (v as i64)).sum();
    if sumsq == 0 {
        0.0
    } else {
        1.0 / (sumsq as f32).sqrt()
    }
}

pub fn inv_norm_u8(row: &[u8]) -> f32 {
    let sumsq: u64 = row.iter().map(|&v| (v as u64) * (v as u64)).sum();
    if sumsq == 0 {
        0.0
    } else {
        1.0 / (sumsq as f32).sqrt()
    }
}

pub fn inv_norm_f32(row: &[f32]) -> f32 {
    let sumsq: f32 = row.iter().map(|&v| v * v).sum();
    if sumsq == 0.0 {
        0.0
    } else {
        1.0 / sumsq.sqrt()
    }
}

pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// `c[i] += dot(aT[i], b)` for `m` rows of length `k`, `aT` row `i` starting
/// at `i * stride_a` (spec.md §4.E `gemv`; comment in
/// `original_source/src/gemm.h`: "c += a.transpose() * b").
pub fn gemv_f32(m: usize, k: usize, a_t: &[f32], stride_a: usize, b: &[f32], c: &mut [f32]) {
    for i in 0..m {
        let row = &a_t[i * stride_a..i * stride_a + k];
        c[i] += dot_f32(row, b);
    }
}

/// `c += aT^T * b`, `aT` is `m` rows of length `k` with row stride
/// `stride_a`, `b` is `k` rows of length `n` with row stride `stride_b`,
/// `c` is `m` rows of length `n` with row stride `stride_c`.
pub fn gemm_f32(
    m: usize,
    n: usize,
    k: usize,
    a_t: &[f32],
    stride_a: usize,
    b: &[f32],
    stride_b: usize,
    c: &mut [f32],
    stride_c: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0f32;
            for kk in 0..k {
                acc += a_t[i * stride_a + kk] * b[kk * stride_b + j];
            }
            c[i * stride_c + j] += acc;
        }
    }
}
