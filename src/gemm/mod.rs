//! Arch-specialized GEMM/GEMV kernels (component E).
//!
//! Grounded on `original_source/src/qgemm.hpp` (`scatteredGEMMBaseline`,
//! `scatteredGEMMOpt`'s small-m/n shape dispatch) and `gemm.h` (the fp32
//! `gemv`/`invNorm` contract). Dispatch is realized as a function-pointer
//! table chosen once at model-load time from a CPU-feature probe, per the
//! "systems language without zero-cost generics" design note in spec.md §9.

pub mod avx2;
pub mod scalar;

/// Closed set of arch tags from spec.md §4.E. Only `None`/`Balanced` and
/// `Avx2` (x86_64) are backed by a distinct implementation in this crate;
/// every other tag resolves to the scalar kernel at dispatch-table
/// construction time (SPEC_FULL.md §4.E, DESIGN.md open question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    None,
    Balanced,
    Sse2,
    Sse41,
    Avx2,
    AvxVnni,
    Avx512bw,
    Avx512vnni,
    Neon,
}

impl Arch {
    /// All tags, in descending order of capability, used to probe the host.
    pub const ALL: [Arch; 9] = [
        Arch::Avx512vnni,
        Arch::Avx512bw,
        Arch::AvxVnni,
        Arch::Avx2,
        Arch::Sse41,
        Arch::Sse2,
        Arch::Neon,
        Arch::Balanced,
        Arch::None,
    ];

    /// True if this crate has a native (non-fallback) kernel for `self` on
    /// the current compile target.
    fn natively_supported(self) -> bool {
        match self {
            Arch::None | Arch::Balanced => true,
            #[cfg(target_arch = "x86_64")]
            Arch::Avx2 => avx2::available(),
            _ => false,
        }
    }
}

/// Probe the host once, at load time, and return the best arch this crate
/// can natively service. Everything else is serviced via the scalar
/// fallback baked into [`KernelTable`].
pub fn detect_best() -> Arch {
    for &arch in Arch::ALL.iter() {
        if arch.natively_supported() {
            return arch;
        }
    }
    Arch::None
}

/// Per-op function pointers selected once at load time (spec.md §9: "Do not
/// pay per-call dispatch overhead").
#[derive(Clone, Copy)]
pub struct KernelTable {
    pub arch: Arch,
    dot_u8_i8: fn(&[u8], &[i8]) -> i32,
    dot_i8_i8: fn(&[i8], &[i8]) -> i32,
}

impl KernelTable {
    /// Builds the table for `requested`, falling back to the scalar kernel
    /// (and logging once) for any op `requested` can't natively service on
    /// this target.
    pub fn build(requested: Arch) -> KernelTable {
        let effective = if requested.natively_supported() {
            requested
        } else {
            tracing::warn!(
                requested = ?requested,
                "no native SIMD kernel for this arch on this target, falling back to scalar"
            );
            Arch::None
        };

        let (dot_u8_i8, dot_i8_i8): (fn(&[u8], &[i8]) -> i32, fn(&[i8], &[i8]) -> i32) =
            match effective {
                #[cfg(target_arch = "x86_64")]
                Arch::Avx2 => (avx2::dot_u8_i8, avx2::dot_i8),
                _ => (scalar::dot_u8_i8, scalar::dot_i8),
            };

        KernelTable {
            arch: effective,
            dot_u8_i8,
            dot_i8_i8,
        }
    }

    #[inline]
    pub fn dot_u8_i8(&self, a: &[u8], b: &[i8]) -> i32 {
        (self.dot_u8_i8)(a, b)
    }

    #[inline]
    pub fn dot_i8_i8(&self, a: &[i8], b: &[i8]) -> i32 {
        (self.dot_i8_i8)(a, b)
    }
}

/// Per-row metadata for the "A" (context) side of a scattered GEMM.
pub struct ARowMeta<'a> {
    pub scale: &'a [f32],
    pub bias: &'a [f32],
}

/// Per-row metadata for the "B" (output) side of a scattered GEMM.
pub struct BRowMeta<'a> {
    pub scale: &'a [f32],
    pub hsum: &'a [i32],
}

/// `C[i,j] = (dot(A[aIdx[i]], B[bIdx[j]]) - hsum[bIdx[j]]) * aScale[aIdx[i]]
/// * bScale[bIdx[j]] + aBias[aIdx[i]]` — the quantized scattered-GEMM
/// formula of spec.md §4.E, computed via the selected kernel's raw integer
/// dot product.
#[allow(clippy::too_many_arguments)]
pub fn scattered_gemm_quant(
    kernels: &KernelTable,
    m: usize,
    n: usize,
    k: usize,
    a_base: &[u8],
    a_idx: &[i32],
    a_stride: usize,
    a_meta: &ARowMeta,
    b_base: &[i8],
    b_idx: &[i32],
    b_stride: usize,
    b_meta: &BRowMeta,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        let ai = a_idx[i] as usize;
        let a_row = &a_base[ai * a_stride..ai * a_stride + k];
        for j in 0..n {
            let bj = b_idx[j] as usize;
            let b_row = &b_base[bj * b_stride..bj * b_stride + k];
            let acc = kernels.dot_u8_i8(a_row, b_row);
            let corrected = acc - b_meta.hsum[bj];
            c[i * ldc + j] =
                corrected as f32 * a_meta.scale[ai] * b_meta.scale[bj] + a_meta.bias[ai];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_best_is_always_serviceable() {
        let arch = detect_best();
        assert!(arch.natively_supported());
    }

    #[test]
    fn kernel_table_falls_back_for_unimplemented_arch() {
        let table = KernelTable::build(Arch::Neon);
        assert_eq!(table.arch, Arch::None);
    }

    #[test]
    fn scattered_gemm_matches_manual_formula() {
        let table = KernelTable::build(Arch::None);
        let dim = 4;
        let a_base: Vec<u8> = vec![1, 2, 3, 4, 10, 10, 10, 10];
        let b_base: Vec<i8> = vec![1, 1, 1, 1, -1, -1, -1, -1];
        let a_scale = [0.5f32, 0.25];
        let a_bias = [0.1f32, -0.2];
        let b_scale = [1.0f32, 2.0];
        let b_hsum = [0i32, 4];
        let a_idx = [0i32, 1];
        let b_idx = [0i32, 1];
        let mut c = vec![0f32; 4];
        scattered_gemm_quant(
            &table,
            2,
            2,
            dim,
            &a_base,
            &a_idx,
            dim,
            &ARowMeta {
                scale: &a_scale,
                bias: &a_bias,
            },
            &b_base,
            &b_idx,
            dim,
            &BRowMeta {
                scale: &b_scale,
                hsum: &b_hsum,
            },
            &mut c,
            2,
        );
        // manual check for (0,0): dot([1,2,3,4],[1,1,1,1]) = 10, hsum=0
        assert!((c[0] - (10.0 * 0.5 * 1.0 + 0.1)).abs() < 1e-6);
        // (1,1): dot([10,10,10,10],[-1,-1,-1,-1]) = -40, hsum=4 -> (-40-4)*0.25*2 + -0.2
        assert!((c[3] - ((-40.0 - 4.0) * 0.25 * 2.0 - 0.2)).abs() < 1e-6);
    }
}
