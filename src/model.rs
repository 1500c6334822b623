//! Model container (component G): owns the parsed header, the context
//! trie, the three embedding arenas, and the arch-selected kernel table,
//! and implements the scoring/similarity operations of spec.md §4.G.
//!
//! Grounded on `original_source/src/CoNgramModel.cpp`'s `CoNgramModel`
//! constructor (arena loading) and its `progress` method (lines ~683-760:
//! the distant-mixture branch's `contextIdcs`/`lls` staging buffer and the
//! `lls[0] -= validTokenSum; ll = logSumExp(lls) + validTokenSum` uniform-
//! shift trick, and the plain `acc -= hsum; ll = acc*scale*scale + bias`
//! branch).

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use rayon::prelude::*;

use crate::error::{ModelError, Result};
use crate::gemm::{self, ARowMeta, BRowMeta, KernelTable};
use crate::header::Header;
use crate::mathx;
use crate::quant;
use crate::state::{LmState, MAX_WINDOW};
use crate::trie::Trie;

pub type VocabId = u32;
pub type ContextId = u32;

fn read_f16(buf: &[u8], pos: &mut usize) -> f32 {
    let bits = LittleEndian::read_u16(&buf[*pos..*pos + 2]);
    *pos += 2;
    f16::from_bits(bits).to_f32()
}

fn read_f32(buf: &[u8], pos: &mut usize) -> f32 {
    let v = LittleEndian::read_f32(&buf[*pos..*pos + 4]);
    *pos += 4;
    v
}

/// Reads one quantized row's vector block (`dim` int8 values, or `dim/2`
/// int4 nibbles plus scales) and returns it still signed, alongside the
/// row-wide scale. Shared by the context/distant (unsigned) and output
/// (signed) row readers below.
fn read_quant_vector(buf: &[u8], pos: &mut usize, dim: usize, qbit: u8, qgroup: u8) -> (Vec<i8>, f32) {
    match qbit {
        8 => {
            let raw = &buf[*pos..*pos + dim];
            *pos += dim;
            let signed: Vec<i8> = raw.iter().map(|&b| b as i8).collect();
            let scale = read_f16(buf, pos);
            (signed, scale)
        }
        4 => {
            let packed_len = dim.div_ceil(2);
            let packed = buf[*pos..*pos + packed_len].to_vec();
            *pos += packed_len;
            let global_scale = read_f16(buf, pos);
            let num_groups = dim / qgroup as usize;
            let local_scales = buf[*pos..*pos + num_groups].to_vec();
            *pos += num_groups;
            quant::requantize_int4_to_int8(&packed, dim, qgroup as usize, global_scale, &local_scales)
        }
        _ => unreachable!("qbit validated at header parse time"),
    }
}

/// One embedding arena (context, output, or distant): a flat row-major
/// buffer plus the per-row scalar metadata spec.md §3.4 lists for that
/// arena kind. Unused metadata vectors stay empty (e.g. `hsum` on a
/// context arena, `valid_token_sum` on an output arena).
struct Arena {
    dim: usize,
    n_rows: usize,
    quantized: bool,
    /// Context/distant rows are stored `+128`-shifted to unsigned so they
    /// can feed a `u8 x i8` VNNI-style dot; output rows stay signed.
    rows_u8: Vec<u8>,
    rows_i8: Vec<i8>,
    rows_f32: Vec<f32>,
    scale: Vec<f32>,
    bias: Vec<f32>,
    confid: Vec<f32>,
    valid_token_sum: Vec<f32>,
    hsum: Vec<i32>,
}

enum RowKind {
    ContextLike { with_window_fields: bool },
    Output,
}

impl Arena {
    fn read(
        buf: &[u8],
        pos: &mut usize,
        n_rows: usize,
        header: &Header,
        kind: RowKind,
    ) -> Result<Arena> {
        let dim = header.dim as usize;
        let quantized = header.quantized();
        let mut rows_u8 = Vec::new();
        let mut rows_i8 = Vec::new();
        let mut rows_f32 = Vec::new();
        let mut scale = Vec::with_capacity(if quantized { n_rows } else { 0 });
        let mut bias = Vec::with_capacity(n_rows);
        let mut confid = Vec::new();
        let mut valid_token_sum = Vec::new();
        let mut hsum = Vec::new();

        if quantized {
            match kind {
                RowKind::Output => rows_i8.reserve(n_rows * dim),
                RowKind::ContextLike { .. } => rows_u8.reserve(n_rows * dim),
            }
        } else {
            rows_f32.reserve(n_rows * dim);
        }

        for _ in 0..n_rows {
            if quantized {
                let (signed, row_scale) = read_quant_vector(buf, pos, dim, header.qbit, header.qgroup);
                scale.push(row_scale);
                match kind {
                    RowKind::Output => {
                        hsum.push(quant::precompute_hsum(&signed));
                        rows_i8.extend_from_slice(&signed);
                    }
                    RowKind::ContextLike { .. } => {
                        rows_u8.extend(quant::apply_unsigned_bias(&signed));
                    }
                }
            } else {
                for _ in 0..dim {
                    rows_f32.push(read_f32(buf, pos));
                }
            }

            match kind {
                RowKind::Output => {}
                RowKind::ContextLike { with_window_fields } => {
                    bias.push(read_f16(buf, pos));
                    if with_window_fields {
                        confid.push(read_f16(buf, pos));
                        valid_token_sum.push(read_f16(buf, pos));
                    }
                }
            }
        }

        Ok(Arena {
            dim,
            n_rows,
            quantized,
            rows_u8,
            rows_i8,
            rows_f32,
            scale,
            bias,
            confid,
            valid_token_sum,
            hsum,
        })
    }

    fn row_u8(&self, idx: usize) -> &[u8] {
        &self.rows_u8[idx * self.dim..idx * self.dim + self.dim]
    }

    fn row_i8(&self, idx: usize) -> &[i8] {
        &self.rows_i8[idx * self.dim..idx * self.dim + self.dim]
    }

    fn row_f32_plain(&self, idx: usize) -> &[f32] {
        &self.rows_f32[idx * self.dim..idx * self.dim + self.dim]
    }

    /// Real-valued (unbiased, descaled) embedding, regardless of storage
    /// format. Allocates; reserved for similarity/diagnostic queries, never
    /// the hot scoring path.
    fn dequantized_row(&self, idx: usize) -> Vec<f32> {
        if !self.quantized {
            return self.row_f32_plain(idx).to_vec();
        }
        let scale = self.scale[idx];
        if !self.rows_u8.is_empty() {
            self.row_u8(idx)
                .iter()
                .map(|&v| (v as i32 - 128) as f32 * scale)
                .collect()
        } else {
            self.row_i8(idx).iter().map(|&v| v as f32 * scale).collect()
        }
    }
}

/// Per-row metadata for a scattered GEMM call into a context-like arena.
fn context_arow_meta(a: &Arena) -> ARowMeta<'_> {
    ARowMeta {
        scale: &a.scale,
        bias: &a.bias,
    }
}

fn output_brow_meta(a: &Arena) -> BRowMeta<'_> {
    BRowMeta {
        scale: &a.scale,
        hsum: &a.hsum,
    }
}

pub struct Model {
    header: Header,
    pub(crate) trie: Trie,
    pub(crate) kernels: KernelTable,
    context: Arena,
    output: Arena,
    distant: Option<Arena>,
    /// `[W+1]`, empty if `W == 0`.
    position_confidence: Vec<f32>,
    /// `ceil(vocabSize/8)` bytes, LSB-first within each byte; empty if `W == 0`.
    distant_mask: Vec<u8>,
    inv_norm_context: Vec<f32>,
    inv_norm_output: Vec<f32>,
}

impl Model {
    pub fn load(path: impl AsRef<Path>) -> Result<Model> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the model file is assumed not to be mutated concurrently,
        // the standard caveat for mmap-based model loaders.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Model::from_bytes(&mmap)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Model> {
        let header = Header::parse(bytes)?;
        let num_nodes = header.num_nodes as usize;

        let mut npos = header.node_offset as usize;
        let (node_sizes, _) = crate::bitio::stream_vbyte_decode(&bytes[npos..], num_nodes);
        npos = header.key_offset as usize;
        let (edge_labels, _) = crate::bitio::stream_vbyte_decode(&bytes[npos..], num_nodes.saturating_sub(1));
        npos = header.value_offset as usize;
        let (values, _) = crate::bitio::stream_vbyte_decode(&bytes[npos..], num_nodes);

        let trie = Trie::build(&node_sizes, &edge_labels, &values, header.vocab_size, header.key_size)?;

        let has_window = header.window_size > 0;
        let mut epos = header.emb_offset as usize;
        let context = Arena::read(
            bytes,
            &mut epos,
            header.context_size as usize,
            &header,
            RowKind::ContextLike {
                with_window_fields: has_window,
            },
        )?;
        let output = Arena::read(bytes, &mut epos, header.vocab_size as usize, &header, RowKind::Output)?;

        let (distant, position_confidence, distant_mask) = if has_window {
            let distant = Arena::read(
                bytes,
                &mut epos,
                header.vocab_size as usize,
                &header,
                RowKind::ContextLike {
                    with_window_fields: true,
                },
            )?;
            let mut pc = vec![0f32; header.window_size as usize + 1];
            for slot in pc.iter_mut().skip(1) {
                *slot = read_f16(bytes, &mut epos);
            }
            let mask_len = (header.vocab_size as usize + 7) / 8;
            if epos + mask_len > bytes.len() {
                return Err(ModelError::CorruptModel("distantMask truncated".to_string()));
            }
            let mask = bytes[epos..epos + mask_len].to_vec();
            epos += mask_len;
            (Some(distant), pc, mask)
        } else {
            (None, Vec::new(), Vec::new())
        };
        let _ = epos; // no further sections follow

        let inv_norm_context = compute_inv_norms(&context);
        let inv_norm_output = compute_inv_norms(&output);

        let kernels = KernelTable::build(gemm::detect_best());

        Ok(Model {
            header,
            trie,
            kernels,
            context,
            output,
            distant,
            position_confidence,
            distant_mask,
            inv_norm_context,
            inv_norm_output,
        })
    }

    pub fn window_size(&self) -> u8 {
        self.header.window_size
    }

    pub fn new_state(&self) -> LmState {
        LmState::new(self.header.window_size)
    }

    fn distant_mask_bit(&self, token: VocabId) -> bool {
        if self.distant_mask.is_empty() {
            return false;
        }
        let byte = token as usize / 8;
        let bit = token as usize % 8;
        self.distant_mask
            .get(byte)
            .map(|b| (b >> bit) & 1 == 1)
            .unwrap_or(false)
    }

    fn context_output_score_quant(&self, ctx: ContextId, next: VocabId) -> f32 {
        let a_idx = [ctx as i32];
        let b_idx = [next as i32];
        let mut c = [0f32; 1];
        gemm::scattered_gemm_quant(
            &self.kernels,
            1,
            1,
            self.header.dim as usize,
            &self.context.rows_u8,
            &a_idx,
            self.context.dim,
            &context_arow_meta(&self.context),
            &self.output.rows_i8,
            &b_idx,
            self.output.dim,
            &output_brow_meta(&self.output),
            &mut c,
            1,
        );
        c[0]
    }

    fn context_output_score_plain(&self, ctx: ContextId, next: VocabId) -> f32 {
        let ctx_row = self.context.row_f32_plain(ctx as usize);
        let out_row = self.output.row_f32_plain(next as usize);
        self.context.bias[ctx as usize] + gemm::scalar::dot_f32(ctx_row, out_row)
    }

    /// Compatibility score used both by the plain branch of [`progress`] and
    /// by the prediction queries: `⟨contextEmb(ctx), outputEmb(t)⟩ +
    /// contextBias(ctx)`, with the VNNI hsum correction folded in for the
    /// quantized case.
    fn context_output_score(&self, ctx: ContextId, next: VocabId) -> f32 {
        if self.header.quantized() {
            self.context_output_score_quant(ctx, next)
        } else {
            self.context_output_score_plain(ctx, next)
        }
    }

    /// Single-step scoring (spec.md §4.G). Never allocates on the
    /// distant-mixture branch (it's the hot path); the plain branch is a
    /// single scattered-GEMM call and also allocation-free.
    pub fn progress(&self, state: &LmState, next: VocabId) -> (LmState, f32) {
        let w = self.header.window_size as usize;
        let valid_distant = w > 0 && self.distant_mask_bit(next);
        let ctx = state.ctx_idx;

        let ll = if valid_distant {
            self.progress_mixture(state, next, ctx)
        } else {
            self.context_output_score(ctx, next)
        };

        let mut new_state = *state;
        let mut node_idx = state.node;
        new_state.ctx_idx = self.trie.progress(&mut node_idx, next);
        new_state.node = node_idx;
        if w > 0 {
            new_state.push_distant(if valid_distant { next } else { 0 });
        }
        (new_state, ll)
    }

    fn progress_mixture(&self, state: &LmState, next: VocabId, ctx: ContextId) -> f32 {
        let w = self.header.window_size as usize;
        // `w` is bounded by `state::MAX_WINDOW` (spec.md §6.1: windowSize is
        // 0 or 7), so both scratch buffers are fixed-size stack arrays
        // rather than a per-call heap allocation on this hot path.
        // lls[0..=w]: mixture weights (log-space after softmax), then dot
        // outputs added in; lls[w+1..] is scratch for the GEMM column.
        let mut lls = [0f32; 2 * (MAX_WINDOW + 1)];
        lls[..=w].copy_from_slice(&self.position_confidence[..=w]);
        lls[0] += self.context.confid[ctx as usize];
        let history = state.distant_slots();
        for (k, &tok) in history.iter().enumerate() {
            lls[k + 1] += if tok != 0 {
                self.distant.as_ref().unwrap().confid[tok as usize]
            } else {
                mathx::EMPTY_SLOT_SENTINEL
            };
        }
        mathx::log_softmax(&mut lls[..=w]);

        if self.header.quantized() {
            let distant = self.distant.as_ref().unwrap();
            let mut a_idx = [0i32; MAX_WINDOW + 1];
            a_idx[0] = ctx as i32;
            for (k, &tok) in history.iter().enumerate() {
                a_idx[k + 1] = tok as i32;
            }
            let b_idx = [next as i32];
            let (split_at, rest) = lls[..2 * (w + 1)].split_at_mut(w + 1);
            gemm::scattered_gemm_quant(
                &self.kernels,
                w + 1,
                1,
                self.header.dim as usize,
                &distant.rows_u8,
                &a_idx[1..=w],
                distant.dim,
                &ARowMeta {
                    scale: &distant.scale,
                    bias: &distant.bias,
                },
                &self.output.rows_i8,
                &b_idx,
                self.output.dim,
                &output_brow_meta(&self.output),
                &mut rest[..w],
                1,
            );
            // row 0 (the context slot) is scored against the context arena,
            // not the distant arena; overwrite rest[0] with it directly so
            // the merge loop below is uniform.
            // `context_output_score_quant` already folds `contextBias(ctx)`
            // and the hsum correction in, matching dots[0] exactly.
            split_at[0] += self.context_output_score_quant(ctx, next);
            for i in 0..w {
                split_at[i + 1] += rest[i];
            }
        } else {
            let out_row = self.output.row_f32_plain(next as usize);
            let ctx_row = self.context.row_f32_plain(ctx as usize);
            lls[0] += self.context.bias[ctx as usize] + gemm::scalar::dot_f32(ctx_row, out_row);
            for (k, &tok) in history.iter().enumerate() {
                let row_idx = if tok != 0 { tok as usize } else { 0 };
                let distant = self.distant.as_ref().unwrap();
                let d_row = distant.row_f32_plain(row_idx);
                lls[k + 1] += distant.bias[row_idx] + gemm::scalar::dot_f32(d_row, out_row);
            }
        }

        for k in 0..w {
            lls[k + 1] += self.context.valid_token_sum[ctx as usize];
        }
        mathx::log_sum_exp(&lls[..=w])
    }

    pub fn to_context_id(&self, history: &[VocabId]) -> ContextId {
        self.trie.to_context_id(history)
    }

    pub fn context_word_map(&self) -> Vec<Vec<Vec<VocabId>>> {
        self.trie.context_word_map(self.header.context_size as usize)
    }

    pub fn word_similarity(&self, i: VocabId, j: VocabId) -> f32 {
        let (i, j) = (i as usize, j as usize);
        if i >= self.output.n_rows || j >= self.output.n_rows {
            return f32::NAN;
        }
        let raw = if self.output.quantized {
            self.kernels.dot_i8_i8(self.output.row_i8(i), self.output.row_i8(j)) as f32
                * self.output.scale[i]
                * self.output.scale[j]
        } else {
            gemm::scalar::dot_f32(self.output.row_f32_plain(i), self.output.row_f32_plain(j))
        };
        raw * self.inv_norm_output[i] * self.inv_norm_output[j]
    }

    pub fn most_similar_words(&self, id: VocabId, k: usize) -> Vec<(VocabId, f32)> {
        most_similar(id, self.output.n_rows, k, |j| self.word_similarity(id, j as VocabId))
    }

    pub fn context_similarity(&self, i: ContextId, j: ContextId) -> f32 {
        let (iu, ju) = (i as usize, j as usize);
        if iu >= self.context.n_rows || ju >= self.context.n_rows {
            return f32::NAN;
        }
        let a = self.context.dequantized_row(iu);
        let b = self.context.dequantized_row(ju);
        gemm::scalar::dot_f32(&a, &b) * self.inv_norm_context[iu] * self.inv_norm_context[ju]
    }

    /// Iterates `contextSize` entries, per spec.md §9's explicit
    /// instruction (see DESIGN.md open question 2): the reference's
    /// `vocabSize`-bounded loop is not replicated.
    pub fn most_similar_contexts(&self, id: ContextId, k: usize) -> Vec<(ContextId, f32)> {
        most_similar(id, self.context.n_rows, k, |j| {
            self.context_similarity(id, j as ContextId)
        })
    }

    pub fn predict_words_from_context(&self, ctx: ContextId, k: usize) -> Vec<(VocabId, f32)> {
        if ctx as usize >= self.context.n_rows {
            return Vec::new();
        }
        top_k(self.output.n_rows, k, |t| self.context_output_score(ctx, t as VocabId))
    }

    pub fn predict_words_from_context_diff(
        &self,
        ctx: ContextId,
        bg: ContextId,
        weight: f32,
        k: usize,
    ) -> Vec<(VocabId, f32)> {
        if ctx as usize >= self.context.n_rows || bg as usize >= self.context.n_rows {
            return Vec::new();
        }
        top_k(self.output.n_rows, k, |t| {
            self.context_output_score(ctx, t as VocabId) - weight * self.context_output_score(bg, t as VocabId)
        })
    }
}

fn compute_inv_norms(arena: &Arena) -> Vec<f32> {
    (0..arena.n_rows)
        .into_par_iter()
        .map(|i| {
            if arena.quantized {
                let sumsq: f64 = if !arena.rows_u8.is_empty() {
                    arena
                        .row_u8(i)
                        .iter()
                        .map(|&v| {
                            let signed = v as i32 - 128;
                            (signed * signed) as f64
                        })
                        .sum()
                } else {
                    arena
                        .row_i8(i)
                        .iter()
                        .map(|&v| (v as i32 * v as i32) as f64)
                        .sum()
                };
                let norm = (sumsq as f32).sqrt() * arena.scale[i];
                if norm > 0.0 {
                    1.0 / norm
                } else {
                    0.0
                }
            } else {
                gemm::scalar::inv_norm_f32(arena.row_f32_plain(i))
            }
        })
        .collect()
}

/// Exhaustively scores every id `0..n` other than `exclude` with `score`,
/// keeping the top `k` by descending score. Used by the similarity queries,
/// which spec.md §5 doesn't classify as hot-path (allocation is fine).
fn most_similar(exclude: u32, n: usize, k: usize, score: impl Fn(usize) -> f32) -> Vec<(u32, f32)> {
    let mut scored: Vec<(u32, f32)> = (0..n)
        .filter(|&j| j as u32 != exclude)
        .map(|j| (j as u32, score(j)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

fn top_k(n: usize, k: usize, score: impl Fn(usize) -> f32) -> Vec<(VocabId, f32)> {
    let mut scored: Vec<(u32, f32)> = (0..n).map(|j| (j as u32, score(j))).collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}
