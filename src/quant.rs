//! Quantized tensor block (component C): dequantizing and requantizing the
//! packed embedding rows described in spec.md §3.4/§4.C.
//!
//! Grounded on spec.md §4.C and the row accessors in
//! `original_source/src/CoNgramModel.hpp` (`getContextQuantEmb`,
//! `getOutputQuantEmb`, ... and the `acc -= hsum` VNNI correction in
//! `original_source/src/qgemm.hpp`'s `scatteredGEMMBaseline`).

use crate::error::{ModelError, Result};

/// `qbit` must be 4 or 8; `qgroup` must divide `dim` for the int4 format.
pub fn validate_quant_params(qbit: u8, qgroup: u8, dim: u32) -> Result<()> {
    match qbit {
        0 => Ok(()), // fp32, unquantized
        8 => Ok(()),
        4 => {
            if qgroup == 0 || dim % qgroup as u32 != 0 {
                Err(ModelError::UnsupportedQuant {
                    qbit,
                    window: 0,
                    key_size: 0,
                })
            } else {
                Ok(())
            }
        }
        _ => Err(ModelError::UnsupportedQuant {
            qbit,
            window: 0,
            key_size: 0,
        }),
    }
}

/// Dequantize a per-row int8 vector: `value = int8 * scale`.
pub fn dequantize_int8(row: &[i8], scale: f32) -> Vec<f32> {
    row.iter().map(|&v| v as f32 * scale).collect()
}

/// Expand one grouped-int4 row (`dim/2` packed nibbles, a global fp16 scale
/// already expanded to fp32, and `dim/qgroup` per-group uint8 local scales)
/// into full fp32 values.
///
/// Nibbles are interpreted as signed 4-bit two's complement (-8..=7); the
/// effective per-group scale is `global_scale * (local_scale + 1) / 256`
/// (the `+1`/`256` keeps the scale strictly positive and bounded to
/// `(0, global_scale]`).
pub fn dequantize_int4(packed: &[u8], dim: usize, qgroup: usize, global_scale: f32, local_scales: &[u8]) -> Vec<f32> {
    debug_assert_eq!(packed.len(), dim.div_ceil(2));
    debug_assert_eq!(local_scales.len(), dim / qgroup);
    let mut out = Vec::with_capacity(dim);
    for idx in 0..dim {
        let nibble = read_nibble(packed, idx);
        let group = idx / qgroup;
        let eff_scale = global_scale * (local_scales[group] as f32 + 1.0) / 256.0;
        out.push(nibble as f32 * eff_scale);
    }
    out
}

fn read_nibble(packed: &[u8], idx: usize) -> i8 {
    let byte = packed[idx / 2];
    let raw = if idx % 2 == 0 {
        byte & 0x0F
    } else {
        (byte >> 4) & 0x0F
    };
    // sign-extend 4-bit two's complement
    if raw >= 8 {
        raw as i8 - 16
    } else {
        raw as i8
    }
}

/// Requantizes a grouped-int4 row to int8, merging the global and per-group
/// scales into a single effective scale for the whole row (spec.md §4.C).
/// Returns the requantized row and the row-wide scale.
pub fn requantize_int4_to_int8(
    packed: &[u8],
    dim: usize,
    qgroup: usize,
    global_scale: f32,
    local_scales: &[u8],
) -> (Vec<i8>, f32) {
    let num_groups = dim / qgroup;
    let group_scales: Vec<f32> = (0..num_groups)
        .map(|g| global_scale * (local_scales[g] as f32 + 1.0) / 256.0)
        .collect();
    let row_scale = group_scales
        .iter()
        .cloned()
        .fold(f32::MIN_POSITIVE, f32::max);

    let mut out = Vec::with_capacity(dim);
    for idx in 0..dim {
        let nibble = read_nibble(packed, idx);
        let group = idx / qgroup;
        let value = nibble as f32 * group_scales[group];
        let q = (value / row_scale).round().clamp(-127.0, 127.0) as i8;
        out.push(q);
    }
    (out, row_scale)
}

/// Applies the +128 bias so a signed int8 row can participate in a
/// `u8 x i8 -> i32` VNNI-style dot product.
pub fn apply_unsigned_bias(signed: &[i8]) -> Vec<u8> {
    signed.iter().map(|&v| (v as i32 + 128) as u8).collect()
}

/// The correction term a VNNI kernel must subtract after dotting the
/// bias-shifted row against `signed`: `dot(signed_a + 128, b) - hsum ==
/// dot(signed_a, b)` where `hsum = 128 * sum(b)`.
pub fn precompute_hsum(signed: &[i8]) -> i32 {
    128 * signed.iter().map(|&v| v as i32).sum::<i32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_bias_roundtrips_dot_product() {
        let a: Vec<i8> = vec![-5, 3, 127, -128, 0, 10];
        let b: Vec<i8> = vec![2, -1, 3, 4, -7, 6];
        let direct: i32 = a.iter().zip(&b).map(|(&x, &y)| x as i32 * y as i32).sum();

        let a_unsigned = apply_unsigned_bias(&a);
        let hsum = precompute_hsum(&b);
        let via_unsigned: i32 = a_unsigned
            .iter()
            .zip(&b)
            .map(|(&x, &y)| x as i32 * y as i32)
            .sum::<i32>()
            - hsum;
        assert_eq!(direct, via_unsigned);
    }

    #[test]
    fn int4_round_trip_is_lossy_but_bounded() {
        let dim = 8;
        let qgroup = 4;
        let packed = [0x31u8, 0x7Fu8, 0x92u8, 0xA5u8]; // 8 nibbles
        let local_scales = [200u8, 50u8];
        let global_scale = 0.1f32;
        let deq = dequantize_int4(&packed, dim, qgroup, global_scale, &local_scales);
        assert_eq!(deq.len(), dim);

        let (req, row_scale) = requantize_int4_to_int8(&packed, dim, qgroup, global_scale, &local_scales);
        assert_eq!(req.len(), dim);
        for (i, &q) in req.iter().enumerate() {
            let reconstructed = q as f32 * row_scale;
            assert!((reconstructed - deq[i]).abs() <= row_scale * 1.0 + 1e-6);
        }
    }

    #[test]
    fn validate_quant_params_rejects_bad_group() {
        assert!(validate_quant_params(4, 3, 8).is_err()); // 3 doesn't divide 8
        assert!(validate_quant_params(4, 4, 8).is_ok());
        assert!(validate_quant_params(8, 0, 8).is_ok());
        assert!(validate_quant_params(5, 0, 8).is_err());
    }
}
