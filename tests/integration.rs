//! Cross-module invariants not already pinned down by a single module's own
//! `#[cfg(test)]` suite (spec.md §8.1/§8.2): the `progress`/`toContextId`
//! consistency invariant, `progressMatrix`'s W > 0 distant-mixture branch
//! threaded end-to-end, and the "same bytes reloaded score identically"
//! round-trip property.

use byteorder::ByteOrder;
use congram_lm::bitio::stream_vbyte_encode;
use congram_lm::header::HEADER_LEN;
use congram_lm::Model;

/// A small trie with one two-hop path (root -[2]-> internal -[3]-> leaf 7)
/// and one direct leaf (root -[1]-> leaf 5), W = 0, plain fp32 rows.
/// Mirrors spec.md §8.3 scenarios 2/3's shape but through the crate's public
/// `Model` API rather than `trie::Trie` directly, to exercise the full
/// load -> progress pipeline.
fn branching_trie_model_bytes() -> Vec<u8> {
    let dim = 4u32;
    let vocab_size = 4u32;
    let context_size = 8u32;

    let node_sizes = [2u32, 0u32, 1u32, 0u32];
    let edge_labels = [1u32, 2u32, 3u32];
    let values = [0u32, 5u32, 0u32, 7u32];

    let mut body = Vec::new();
    let node_bytes = stream_vbyte_encode(&node_sizes);
    let key_bytes = stream_vbyte_encode(&edge_labels);
    let value_bytes = stream_vbyte_encode(&values);

    let node_offset = HEADER_LEN as u64;
    body.extend_from_slice(&node_bytes);
    pad16(&mut body);
    let key_offset = HEADER_LEN as u64 + body.len() as u64;
    body.extend_from_slice(&key_bytes);
    pad16(&mut body);
    let value_offset = HEADER_LEN as u64 + body.len() as u64;
    body.extend_from_slice(&value_bytes);
    pad16(&mut body);
    let emb_offset = HEADER_LEN as u64 + body.len() as u64;

    // contextRow (W=0, unquantized): dim f32 + bias fp16
    for ctx in 0..context_size {
        for d in 0..dim {
            body.extend_from_slice(&((ctx * dim + d) as f32 * 0.01).to_le_bytes());
        }
        body.extend_from_slice(&half::f16::from_f32(0.05).to_le_bytes());
    }
    // outputRow (unquantized): dim f32, no trailing fields
    for tok in 0..vocab_size {
        for d in 0..dim {
            body.extend_from_slice(&((tok * dim + d) as f32 * 0.02).to_le_bytes());
        }
    }

    let mut header = vec![0u8; HEADER_LEN];
    byteorder::LittleEndian::write_u32(&mut header[0..4], dim);
    byteorder::LittleEndian::write_u32(&mut header[4..8], context_size);
    byteorder::LittleEndian::write_u32(&mut header[8..12], vocab_size);
    header[12] = 2; // keySize
    header[13] = 0; // windowSize
    header[14] = 0; // qbit (plain fp32)
    header[15] = 0; // qgroup
    byteorder::LittleEndian::write_u32(&mut header[16..20], node_sizes.len() as u32);
    byteorder::LittleEndian::write_u64(&mut header[20..28], node_offset);
    byteorder::LittleEndian::write_u64(&mut header[28..36], key_offset);
    byteorder::LittleEndian::write_u64(&mut header[36..44], value_offset);
    byteorder::LittleEndian::write_u64(&mut header[44..52], emb_offset);

    let mut bytes = header;
    bytes.extend_from_slice(&body);
    bytes
}

/// A root-only trie (no ctx transitions), W = 7, plain fp32 rows, with
/// tokens 1..=3 marked distant-mask-eligible (token 0 stays the reserved
/// "empty slot" sentinel). Exercises the distant-mixture branch of
/// `progress`/`progress_matrix` without entangling it with trie walking.
fn distant_mixture_model_bytes() -> Vec<u8> {
    let dim = 2u32;
    let vocab_size = 4u32;
    let context_size = 2u32;
    let window_size = 7u8;

    let node_sizes = [0u32];
    let edge_labels: [u32; 0] = [];
    let values = [0u32];

    let mut body = Vec::new();
    let node_bytes = stream_vbyte_encode(&node_sizes);
    let key_bytes = stream_vbyte_encode(&edge_labels);
    let value_bytes = stream_vbyte_encode(&values);

    let node_offset = HEADER_LEN as u64;
    body.extend_from_slice(&node_bytes);
    pad16(&mut body);
    let key_offset = HEADER_LEN as u64 + body.len() as u64;
    body.extend_from_slice(&key_bytes);
    pad16(&mut body);
    let value_offset = HEADER_LEN as u64 + body.len() as u64;
    body.extend_from_slice(&value_bytes);
    pad16(&mut body);
    let emb_offset = HEADER_LEN as u64 + body.len() as u64;

    // contextRow (W>0, unquantized): dim f32 + bias/confid/validTokenSum fp16
    for ctx in 0..context_size {
        for d in 0..dim {
            body.extend_from_slice(&((ctx * dim + d) as f32 * 0.03).to_le_bytes());
        }
        body.extend_from_slice(&half::f16::from_f32(0.1).to_le_bytes()); // bias
        body.extend_from_slice(&half::f16::from_f32(0.2).to_le_bytes()); // confid
        body.extend_from_slice(&half::f16::from_f32(0.05).to_le_bytes()); // validTokenSum
    }
    // outputRow: dim f32, no trailing fields
    for tok in 0..vocab_size {
        for d in 0..dim {
            body.extend_from_slice(&((tok * dim + d) as f32 * 0.04).to_le_bytes());
        }
    }
    // distantRow (W>0, unquantized): same shape as contextRow
    for tok in 0..vocab_size {
        for d in 0..dim {
            body.extend_from_slice(&((tok * dim + d) as f32 * 0.015).to_le_bytes());
        }
        body.extend_from_slice(&half::f16::from_f32(0.07).to_le_bytes());
        body.extend_from_slice(&half::f16::from_f32(0.15).to_le_bytes());
        body.extend_from_slice(&half::f16::from_f32(0.02).to_le_bytes());
    }
    // positionConfidence: windowSize fp16 values (slot 0 is implicit 0.0)
    for k in 0..window_size {
        body.extend_from_slice(&half::f16::from_f32(0.1 * (k as f32 + 1.0)).to_le_bytes());
    }
    // distantMask: ceil(vocabSize/8) bytes; tokens 1..3 eligible, 0 reserved.
    body.push(0b0000_1110u8);

    let mut header = vec![0u8; HEADER_LEN];
    byteorder::LittleEndian::write_u32(&mut header[0..4], dim);
    byteorder::LittleEndian::write_u32(&mut header[4..8], context_size);
    byteorder::LittleEndian::write_u32(&mut header[8..12], vocab_size);
    header[12] = 2; // keySize
    header[13] = window_size;
    header[14] = 0; // qbit
    header[15] = 0; // qgroup
    byteorder::LittleEndian::write_u32(&mut header[16..20], node_sizes.len() as u32);
    byteorder::LittleEndian::write_u64(&mut header[20..28], node_offset);
    byteorder::LittleEndian::write_u64(&mut header[28..36], key_offset);
    byteorder::LittleEndian::write_u64(&mut header[36..44], value_offset);
    byteorder::LittleEndian::write_u64(&mut header[44..52], emb_offset);

    let mut bytes = header;
    bytes.extend_from_slice(&body);
    bytes
}

fn pad16(buf: &mut Vec<u8>) {
    while buf.len() % 16 != 0 {
        buf.push(0);
    }
}

#[test]
fn progress_ctx_matches_to_context_id_over_the_same_history() {
    let model = Model::from_bytes(&branching_trie_model_bytes()).unwrap();

    let s0 = model.new_state();
    let (s1, _) = model.progress(&s0, 2);
    let (s2, _) = model.progress(&s1, 3);

    assert_eq!(s2.ctx_idx, model.to_context_id(&[2, 3]));

    // the direct-leaf path behaves the same way for a single hop.
    let (direct, _) = model.progress(&s0, 1);
    assert_eq!(direct.ctx_idx, model.to_context_id(&[1]));
}

#[test]
fn progress_matrix_equivalence_holds_with_distant_mixture_active() {
    let model = Model::from_bytes(&distant_mixture_model_bytes()).unwrap();

    let s0 = model.new_state();
    let (s1, _) = model.progress(&s0, 1);
    let (prev_a, _) = model.progress(&s1, 2);

    let (t1, _) = model.progress(&s0, 3);
    let (t2, _) = model.progress(&t1, 1);
    let (prev_b, _) = model.progress(&t2, 2);

    let prev = vec![prev_a, prev_b];
    let next_ids = vec![0u32, 1u32, 2u32, 3u32];
    let (states, scores) = model.progress_matrix(&prev, &next_ids, 0);

    for (mi, p) in prev.iter().enumerate() {
        for (ni, &tok) in next_ids.iter().enumerate() {
            let (expect_state, expect_ll) = model.progress(p, tok);
            let idx = mi * next_ids.len() + ni;
            assert_eq!(states[idx].node, expect_state.node);
            let tol = 5e-5 * expect_ll.abs().max(1.0);
            assert!(
                (scores[idx] - expect_ll).abs() <= tol,
                "mismatch at ({mi},{ni}): {} vs {}",
                scores[idx],
                expect_ll
            );
        }
    }
}

#[test]
fn reloading_identical_bytes_scores_identically() {
    let bytes = distant_mixture_model_bytes();
    let model_a = Model::from_bytes(&bytes).unwrap();
    let model_b = Model::from_bytes(&bytes).unwrap();

    let s0a = model_a.new_state();
    let s0b = model_b.new_state();
    let (sa, _) = model_a.progress(&s0a, 1);
    let (sb, _) = model_b.progress(&s0b, 1);

    let prev_a = vec![sa];
    let prev_b = vec![sb];
    let next_ids = vec![0u32, 1u32, 2u32, 3u32];

    let (_, scores_a) = model_a.progress_matrix(&prev_a, &next_ids, 0);
    let (_, scores_b) = model_b.progress_matrix(&prev_b, &next_ids, 0);

    assert_eq!(scores_a, scores_b);
}
