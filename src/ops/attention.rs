//! Grouped-query attention over a single token's query against the full
//! key/value history for one layer.

use super::OpContext;
use crate::error::{EngineError, Result};

/// `Q` is `[n_heads * head_dim]`. `K`/`V` are `[seq_len * n_kv_heads *
/// head_dim]`, position-major (as returned by `KvCache::read_range`).
/// `out` is `[n_heads * head_dim]`. Query head `h` reads KV head
/// `h % n_kv_heads`. `mask`, if present, is added to the raw scores
/// before softmax and must have length `seq_len`; pass `None` for causal
/// decode at the current position (every prior token is legal).
///
/// Per head: softmax with max-shift; if the exponential sum underflows to
/// zero the head's output is all zeros rather than a `NumericError` --
/// that is expected for `seq_len == 0` and is not itself fatal.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    _ctx: OpContext,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    n_heads: u32,
    n_kv_heads: u32,
    head_dim: u32,
    seq_len: u32,
    scale: f32,
    mask: Option<&[f32]>,
) -> Result<()> {
    let n_heads = n_heads as usize;
    let n_kv_heads = n_kv_heads as usize;
    let head_dim = head_dim as usize;
    let seq_len = seq_len as usize;

    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(EngineError::precondition("attention: n_heads must be a multiple of n_kv_heads"));
    }
    if q.len() != n_heads * head_dim || out.len() != n_heads * head_dim {
        return Err(EngineError::precondition("attention: q/out length must equal n_heads * head_dim"));
    }
    if k.len() != seq_len * n_kv_heads * head_dim || v.len() != seq_len * n_kv_heads * head_dim {
        return Err(EngineError::precondition("attention: k/v length must equal seq_len * n_kv_heads * head_dim"));
    }
    if let Some(m) = mask {
        if m.len() != seq_len {
            return Err(EngineError::precondition("attention: mask length must equal seq_len"));
        }
    }

    let kv_stride = n_kv_heads * head_dim;
    let mut scores = vec![0.0f32; seq_len];

    for h in 0..n_heads {
        let kv_h = h % n_kv_heads;
        let q_h = &q[h * head_dim..(h + 1) * head_dim];

        for i in 0..seq_len {
            let k_i = &k[i * kv_stride + kv_h * head_dim..i * kv_stride + (kv_h + 1) * head_dim];
            let dot: f32 = q_h.iter().zip(k_i.iter()).map(|(a, b)| a * b).sum();
            scores[i] = scale * dot + mask.map_or(0.0, |m| m[i]);
        }

        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for s in scores.iter_mut() {
            *s = (*s - max).exp();
            sum_exp += *s;
        }

        let out_h = &mut out[h * head_dim..(h + 1) * head_dim];
        out_h.fill(0.0);
        if sum_exp == 0.0 {
            continue;
        }
        for i in 0..seq_len {
            let weight = scores[i] / sum_exp;
            let v_i = &v[i * kv_stride + kv_h * head_dim..i * kv_stride + (kv_h + 1) * head_dim];
            for d in 0..head_dim {
                out_h[d] += weight * v_i[d];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_position_attends_fully_to_itself() {
        let q = vec![1.0, 0.0];
        let k = vec![1.0, 0.0];
        let v = vec![2.0, 3.0];
        let mut out = vec![0.0; 2];
        attention(OpContext::default(), &q, &k, &v, &mut out, 1, 1, 2, 1, 1.0, None).unwrap();
        assert!((out[0] - 2.0).abs() < 1e-5);
        assert!((out[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn grouped_query_heads_share_kv_head() {
        // 2 query heads, 1 kv head -> both read the same K/V.
        let q = vec![1.0, 0.0, 1.0, 0.0];
        let k = vec![1.0, 0.0];
        let v = vec![5.0, 6.0];
        let mut out = vec![0.0; 4];
        attention(OpContext::default(), &q, &k, &v, &mut out, 2, 1, 2, 1, 1.0, None).unwrap();
        assert!((out[0] - 5.0).abs() < 1e-5);
        assert!((out[2] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn zero_seq_len_yields_zero_output() {
        let q = vec![1.0, 0.0];
        let k: Vec<f32> = vec![];
        let v: Vec<f32> = vec![];
        let mut out = vec![9.0; 2];
        attention(OpContext::default(), &q, &k, &v, &mut out, 1, 1, 2, 0, 1.0, None).unwrap();
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
