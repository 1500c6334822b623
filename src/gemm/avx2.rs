//! Real SIMD specialization for `Arch::Avx2` (x86_64 only). Every other
//! arch tag that isn't implemented natively on this target resolves to
//! `super::scalar` at `KernelTable` construction time (SPEC_FULL.md §4.E).
//!
//! Grounded on spec.md §4.E's `dotS8S8`/`dotU8U8` contract and the
//! `archImpl/avx2_qgemm.hpp` entry named (but not expanded, per the
//! retrieval pack's 300KB/file cap) in `original_source/_INDEX.md`: widen
//! 8-bit lanes to 16-bit before multiplying so no intermediate product can
//! saturate, then use `_mm256_madd_epi16` to reduce pairs into exact i32
//! partial sums.

#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;

/// # Safety
/// Caller must have verified `is_x86_feature_detected!("avx2")`.
#[target_feature(enable = "avx2")]
unsafe fn dot_u8_i8_avx2_inner(a: &[u8], b: &[i8]) -> i32 {
    let n = a.len();
    let ones = _mm256_set1_epi16(1);
    let mut acc = _mm256_setzero_si256();
    let mut i = 0usize;
    while i + 16 <= n {
        let a16 = _mm_loadu_si128(a.as_ptr().add(i) as *const __m128i);
        let b16 = _mm_loadu_si128(b.as_ptr().add(i) as *const __m128i);
        let a_ext = _mm256_cvtepu8_epi16(a16);
        let b_ext = _mm256_cvtepi8_epi16(b16);
        let prod = _mm256_mullo_epi16(a_ext, b_ext);
        let sum32 = _mm256_madd_epi16(prod, ones);
        acc = _mm256_add_epi32(acc, sum32);
        i += 16;
    }
    let mut lanes = [0i32; 8];
    _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, acc);
    let mut total: i32 = lanes.iter().sum();
    while i < n {
        total += a[i] as i32 * b[i] as i32;
        i += 1;
    }
    total
}

/// # Safety
/// Caller must have verified `is_x86_feature_detected!("avx2")`.
#[target_feature(enable = "avx2")]
unsafe fn dot_i8_i8_avx2_inner(a: &[i8], b: &[i8]) -> i32 {
    let n = a.len();
    let ones = _mm256_set1_epi16(1);
    let mut acc = _mm256_setzero_si256();
    let mut i = 0usize;
    while i + 16 <= n {
        let a16 = _mm_loadu_si128(a.as_ptr().add(i) as *const __m128i);
        let b16 = _mm_loadu_si128(b.as_ptr().add(i) as *const __m128i);
        let a_ext = _mm256_cvtepi8_epi16(a16);
        let b_ext = _mm256_cvtepi8_epi16(b16);
        let prod = _mm256_mullo_epi16(a_ext, b_ext);
        let sum32 = _mm256_madd_epi16(prod, ones);
        acc = _mm256_add_epi32(acc, sum32);
        i += 16;
    }
    let mut lanes = [0i32; 8];
    _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, acc);
    let mut total: i32 = lanes.iter().sum();
    while i < n {
        total += a[i] as i32 * b[i] as i32;
        i += 1;
    }
    total
}

pub fn available() -> bool {
    is_x86_feature_detected!("avx2")
}

pub fn dot_u8_i8(a: &[u8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    // SAFETY: only called through the dispatch table after `available()`
    // gated the arch selection at load time.
    unsafe { dot_u8_i8_avx2_inner(a, b) }
}

pub fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    unsafe { dot_i8_i8_avx2_inner(a, b) }
}
