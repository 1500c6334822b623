//! Serialized model header (spec.md §6.1): a fixed 16-byte-aligned preamble
//! declaring the shape of every arena that follows it in the mapped file.
//!
//! Grounded on spec.md §6.1's byte table; `original_source/src/CoNgramModel.cpp`
//! reads these same fields off `header.*` (e.g. `header.numNodes`,
//! `header.embOffset`) but never exposes the raw struct layout in the 300KB
//! retrieval window, so the field order/widths here follow spec.md exactly.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ModelError, Result};

/// Bytes occupied by the header before 16-byte alignment padding.
const RAW_HEADER_LEN: usize = 4 * 3 + 4 + 4 + 8 * 4;
/// The header section itself is padded out to a multiple of 16, per
/// spec.md §6.1 ("Header (aligned 16)").
pub const HEADER_LEN: usize = (RAW_HEADER_LEN + 15) / 16 * 16;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub dim: u32,
    pub context_size: u32,
    pub vocab_size: u32,
    pub key_size: u8,
    pub window_size: u8,
    pub qbit: u8,
    pub qgroup: u8,
    pub num_nodes: u32,
    pub node_offset: u64,
    pub key_offset: u64,
    pub value_offset: u64,
    pub emb_offset: u64,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < RAW_HEADER_LEN {
            return Err(ModelError::CorruptModel(format!(
                "file too short for header: {} bytes",
                bytes.len()
            )));
        }
        let dim = LittleEndian::read_u32(&bytes[0..4]);
        let context_size = LittleEndian::read_u32(&bytes[4..8]);
        let vocab_size = LittleEndian::read_u32(&bytes[8..12]);
        let key_size = bytes[12];
        let window_size = bytes[13];
        let qbit = bytes[14];
        let qgroup = bytes[15];
        let num_nodes = LittleEndian::read_u32(&bytes[16..20]);
        let node_offset = LittleEndian::read_u64(&bytes[20..28]);
        let key_offset = LittleEndian::read_u64(&bytes[28..36]);
        let value_offset = LittleEndian::read_u64(&bytes[36..44]);
        let emb_offset = LittleEndian::read_u64(&bytes[44..52]);

        let header = Header {
            dim,
            context_size,
            vocab_size,
            key_size,
            window_size,
            qbit,
            qgroup,
            num_nodes,
            node_offset,
            key_offset,
            value_offset,
            emb_offset,
        };
        header.validate(bytes.len())?;
        Ok(header)
    }

    fn validate(&self, file_len: usize) -> Result<()> {
        if !matches!(self.window_size, 0 | 7) {
            return Err(ModelError::UnsupportedQuant {
                qbit: self.qbit,
                window: self.window_size,
                key_size: self.key_size,
            });
        }
        if !matches!(self.qbit, 0 | 4 | 8) {
            return Err(ModelError::UnsupportedQuant {
                qbit: self.qbit,
                window: self.window_size,
                key_size: self.key_size,
            });
        }
        if !matches!(self.key_size, 2 | 3 | 4) {
            return Err(ModelError::UnsupportedQuant {
                qbit: self.qbit,
                window: self.window_size,
                key_size: self.key_size,
            });
        }
        if self.qbit == 4 && (self.qgroup == 0 || self.dim % self.qgroup as u32 != 0) {
            return Err(ModelError::UnsupportedQuant {
                qbit: self.qbit,
                window: self.window_size,
                key_size: self.key_size,
            });
        }
        let offsets = [
            self.node_offset,
            self.key_offset,
            self.value_offset,
            self.emb_offset,
        ];
        for &off in &offsets {
            if off as usize > file_len {
                return Err(ModelError::CorruptModel(format!(
                    "offset {off} exceeds file length {file_len}"
                )));
            }
        }
        if self.node_offset < HEADER_LEN as u64 {
            return Err(ModelError::CorruptModel(
                "nodeOffset overlaps header".to_string(),
            ));
        }
        if self.num_nodes == 0 {
            return Err(ModelError::CorruptModel("numNodes must be >= 1 (root)".to_string()));
        }
        Ok(())
    }

    /// `quantized` is false when `qbit == 0` (plain fp32 arenas).
    pub fn quantized(&self) -> bool {
        self.qbit != 0
    }

    pub fn context_emb_stride(&self) -> usize {
        if self.quantized() {
            self.dim as usize + if self.window_size > 0 { 4 } else { 2 } * 4
        } else {
            (self.dim as usize + if self.window_size > 0 { 3 } else { 1 }) * 4
        }
    }

    pub fn output_emb_stride(&self) -> usize {
        if self.quantized() {
            self.dim as usize + 2 * 4
        } else {
            self.dim as usize * 4
        }
    }

    pub fn distant_emb_stride(&self) -> usize {
        if self.quantized() {
            self.dim as usize + 4 * 4
        } else {
            (self.dim as usize + 2) * 4
        }
    }
}
