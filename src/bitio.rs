//! Bit-packing codec (component A) and a minimal StreamVByte decoder
//! (component B, "assumed external" in spec.md but owned here since no
//! other in-workspace crate can decode the node/key/value streams of
//! spec.md §6.1 — see DESIGN.md open question 3).
//!
//! Grounded on `original_source/include/kiwi/BitEncoder.hpp` /
//! `BitUtils.h`: `FixedLengthEncoder` cycles through `lcm(bits,8)/bits`
//! phases of a small packet buffer, and `VariableLengthEncoder` builds a
//! prefix-free code out of a compile-time bit-length sequence. Widths here
//! are runtime header values rather than compile-time constants (see
//! SPEC_FULL.md §4.A), so both codecs are built on a plain LSB-first bit
//! cursor instead of the original's phase-dispatch tables.

fn write_bits(buf: &mut Vec<u8>, pos: &mut usize, width: u32, value: u64) {
    for i in 0..width {
        if (value >> i) & 1 == 1 {
            let byte_idx = (*pos + i as usize) / 8;
            let bit_idx = (*pos + i as usize) % 8;
            if byte_idx >= buf.len() {
                buf.resize(byte_idx + 1, 0);
            }
            buf[byte_idx] |= 1 << bit_idx;
        }
    }
    *pos += width as usize;
}

fn read_bits(buf: &[u8], pos: &mut usize, width: u32) -> u64 {
    let mut value: u64 = 0;
    for i in 0..width {
        let byte_idx = (*pos + i as usize) / 8;
        let bit_idx = (*pos + i as usize) % 8;
        let bit = if byte_idx < buf.len() {
            (buf[byte_idx] >> bit_idx) & 1
        } else {
            0
        };
        value |= (bit as u64) << i;
    }
    *pos += width as usize;
    value
}

/// Append-only bit sink used by both codecs.
#[derive(Default, Clone)]
pub struct BitWriter {
    buf: Vec<u8>,
    pos: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, width: u32, value: u64) {
        write_bits(&mut self.buf, &mut self.pos, width, value);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bit_len(&self) -> usize {
        self.pos
    }
}

/// Bit source reading from a borrowed byte slice.
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BitReader { buf, pos: 0 }
    }

    pub fn read(&mut self, width: u32) -> u64 {
        read_bits(self.buf, &mut self.pos, width)
    }

    pub fn rewind(&mut self, bits: usize) {
        self.pos = self.pos.saturating_sub(bits);
    }

    pub fn bit_pos(&self) -> usize {
        self.pos
    }
}

/// Encodes/decodes a stream of `bits`-wide unsigned integers, where `bits`
/// need not divide 8. `bits` ranges 1..=32 (spec.md §4.A).
pub struct FixedLengthCodec {
    bits: u32,
}

impl FixedLengthCodec {
    pub fn new(bits: u32) -> Self {
        assert!((1..=32).contains(&bits), "bits must be in 1..=32");
        FixedLengthCodec { bits }
    }

    pub fn encode(&self, w: &mut BitWriter, value: u32) {
        let mask: u64 = if self.bits == 32 {
            u32::MAX as u64
        } else {
            (1u64 << self.bits) - 1
        };
        w.write(self.bits, value as u64 & mask);
    }

    pub fn decode(&self, r: &mut BitReader) -> u32 {
        r.read(self.bits) as u32
    }
}

/// Prefix-free variable-length code parameterized by a bit-length sequence
/// `S = (b0, b1, ..., bk-1)`. Value `n` is encoded as the smallest `i` such
/// that `n < sum(2^b0..2^bi)`; see spec.md §4.A for the exact bit layout.
pub struct VariableLengthCodec {
    widths: Vec<u32>,
    bias: Vec<u64>,
}

impl VariableLengthCodec {
    pub fn new(widths: &[u32]) -> Self {
        assert!(!widths.is_empty());
        let mut bias = Vec::with_capacity(widths.len());
        let mut cum: u64 = 0;
        for &b in widths {
            bias.push(cum);
            cum += 1u64 << b;
        }
        VariableLengthCodec {
            widths: widths.to_vec(),
            bias,
        }
    }

    /// Exclusive upper bound of the representable range.
    pub fn max_value(&self) -> u64 {
        let last = self.widths.len() - 1;
        self.bias[last] + (1u64 << self.widths[last])
    }

    pub fn encode(&self, w: &mut BitWriter, n: u64) -> crate::error::Result<()> {
        let last = self.widths.len() - 1;
        for i in 0..self.widths.len() {
            let b_i = self.widths[i];
            let cum = self.bias[i];
            let z = cum + (1u64 << b_i);
            if i == last {
                if n >= z {
                    return Err(crate::error::ModelError::EncodeRange {
                        value: n,
                        bias: z,
                    });
                }
                let payload = n - cum;
                let depth = i as u32;
                w.write(depth + b_i, (payload << depth) | ((1u64 << depth) - 1));
                return Ok(());
            } else if n < z {
                let payload = n - cum;
                let depth = i as u32;
                w.write(
                    depth + 1 + b_i,
                    (payload << (depth + 1)) | ((1u64 << depth) - 1),
                );
                return Ok(());
            }
        }
        unreachable!()
    }

    pub fn decode(&self, r: &mut BitReader) -> u64 {
        let max_prefix_width = (self.widths.len() - 1) as u32;
        let peeked = r.read(max_prefix_width);
        // depth = number of trailing 1-bits in `peeked` (within max_prefix_width bits).
        let mut depth: u32 = 0;
        while depth < max_prefix_width && (peeked >> depth) & 1 == 1 {
            depth += 1;
        }
        let rewind_by = max_prefix_width - (depth + 1).min(max_prefix_width);
        r.rewind(rewind_by as usize);
        let payload = r.read(self.widths[depth as usize]);
        self.bias[depth as usize] + payload
    }
}

/// Minimal StreamVByte decoder: groups of 4 values share one control byte
/// of 2-bit length codes (0 => 1 byte, 3 => 4 bytes), little-endian.
pub fn stream_vbyte_decode(bytes: &[u8], count: usize) -> (Vec<u32>, usize) {
    if count == 0 {
        return (Vec::new(), 0);
    }
    let control_len = (count + 3) / 4;
    let control = &bytes[..control_len];
    let mut data_pos = control_len;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let ctrl = control[i / 4];
        let code = (ctrl >> ((i % 4) * 2)) & 0x3;
        let nbytes = code as usize + 1;
        let mut v: u32 = 0;
        for b in 0..nbytes {
            v |= (bytes[data_pos + b] as u32) << (8 * b);
        }
        data_pos += nbytes;
        out.push(v);
    }
    (out, data_pos)
}

/// Inverse of [`stream_vbyte_decode`]; used only by builder-facing
/// round-trip tests (spec.md §8.2) — there is no runtime encode path.
pub fn stream_vbyte_encode(values: &[u32]) -> Vec<u8> {
    let control_len = values.len().div_ceil(4);
    let mut control = vec![0u8; control_len];
    let mut data = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        let nbytes = if v == 0 { 1 } else { (32 - v.leading_zeros()).div_ceil(8) as usize };
        let code = (nbytes - 1) as u8;
        control[i / 4] |= code << ((i % 4) * 2);
        data.extend_from_slice(&v.to_le_bytes()[..nbytes]);
    }
    control.extend(data);
    control
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn fixed_round_trip_all_widths() {
        for bits in 1..=32u32 {
            let codec = FixedLengthCodec::new(bits);
            let mut w = BitWriter::new();
            let max = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
            let samples = [0u32, 1, max / 2, max];
            for &v in &samples {
                codec.encode(&mut w, v);
            }
            let bytes = w.into_bytes();
            let mut r = BitReader::new(&bytes);
            for &v in &samples {
                assert_eq!(codec.decode(&mut r), v);
            }
        }
    }

    #[test]
    fn variable_length_round_trip_scenario() {
        // §8.3 scenario 4: VariableLengthCodec<(3,5,8)>
        let codec = VariableLengthCodec::new(&[3, 5, 8]);
        let mut w = BitWriter::new();
        for n in 0..272u64 {
            codec.encode(&mut w, n).unwrap();
        }
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        for n in 0..272u64 {
            assert_eq!(codec.decode(&mut r), n);
        }
    }

    #[test]
    fn variable_length_out_of_range_fails() {
        let codec = VariableLengthCodec::new(&[3, 5, 8]);
        let mut w = BitWriter::new();
        assert!(codec.encode(&mut w, codec.max_value()).is_err());
    }

    #[quickcheck]
    fn qc_fixed_round_trip(bits_seed: u8, value: u32) -> bool {
        let bits = (bits_seed % 32) as u32 + 1;
        let codec = FixedLengthCodec::new(bits);
        let mask: u64 = if bits == 32 {
            u32::MAX as u64
        } else {
            (1u64 << bits) - 1
        };
        let v = value as u64 & mask;
        let mut w = BitWriter::new();
        codec.encode(&mut w, v as u32);
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        codec.decode(&mut r) as u64 == v
    }

    #[test]
    fn stream_vbyte_encode_decode_round_trip() {
        let values = vec![0u32, 1, 255, 256, 65535, 65536, 16_777_215, 300, 70000];
        let bytes = stream_vbyte_encode(&values);
        let (decoded, consumed) = stream_vbyte_decode(&bytes, values.len());
        assert_eq!(decoded, values);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn stream_vbyte_basic() {
        // values [1, 300, 70000, 0], lengths [1,2,3,1]
        let control = 0b00_11_01_00u8; // order: value0=code0(1B), value1=code1(2B), value2=code2(3B), value3=code0(1B)
        let mut bytes = vec![control];
        bytes.extend_from_slice(&1u32.to_le_bytes()[..1]);
        bytes.extend_from_slice(&300u32.to_le_bytes()[..2]);
        bytes.extend_from_slice(&70000u32.to_le_bytes()[..3]);
        bytes.extend_from_slice(&0u32.to_le_bytes()[..1]);
        let (vals, consumed) = stream_vbyte_decode(&bytes, 4);
        assert_eq!(vals, vec![1, 300, 70000, 0]);
        assert_eq!(consumed, bytes.len());
    }
}
