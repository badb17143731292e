//! Matrix-vector product of a weight matrix (row-major, `m` rows by `k`
//! columns) against an activation vector, for every weight dtype the
//! container can hold.
//!
//! `matmul_qk` is the hot-path kernel: it dequantizes each weight row
//! on the fly and accumulates a dot product with `x`, working uniformly
//! across F16/F32/Q8_0/Q4_K/Q5_K/Q6_K. `matmul_f32` and `matmul_q8_0` are
//! narrower kernels kept for a uniform operator set across all six
//! container dtypes; no resident or per-layer weight in this engine is
//! ever plain F32, so they sit off the hot path.

use super::OpContext;
use crate::container::GgmlType;
use crate::error::{EngineError, Result};
use crate::quant::dequantize_row;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `y[row] = <dequant(weight[row]), x>` for `row` in `0..m`. `weight_bytes`
/// holds `m` rows back to back, each `dtype.row_byte_size(k)` bytes long.
/// Quantized dtypes (Q4_K/Q5_K/Q6_K) require `k % 256 == 0`.
pub fn matmul_qk(
    _ctx: OpContext,
    weight_bytes: &[u8],
    dtype: GgmlType,
    x: &[f32],
    y: &mut [f32],
    m: usize,
    k: usize,
) -> Result<()> {
    if x.len() != k {
        return Err(EngineError::precondition("matmul_qk: x length must equal k"));
    }
    if y.len() != m {
        return Err(EngineError::precondition("matmul_qk: y length must equal m"));
    }
    if matches!(dtype, GgmlType::Q4K | GgmlType::Q5K | GgmlType::Q6K) && k % 256 != 0 {
        return Err(EngineError::precondition("matmul_qk: k must be a multiple of 256 for k-quant dtypes"));
    }
    let row_bytes = dtype.row_byte_size(k as u64) as usize;
    if weight_bytes.len() < row_bytes * m {
        return Err(EngineError::BufferTooSmall { needed: row_bytes * m, have: weight_bytes.len() });
    }
    for row in 0..m {
        let row_slice = &weight_bytes[row * row_bytes..(row + 1) * row_bytes];
        let dequantized = dequantize_row(dtype, row_slice, k as u64)?;
        y[row] = dot(&dequantized, x);
    }
    Ok(())
}

/// Plain `f32 × f32` matrix-vector product, row-major weight.
pub fn matmul_f32(_ctx: OpContext, weight: &[f32], x: &[f32], y: &mut [f32], m: usize, k: usize) -> Result<()> {
    if x.len() != k || weight.len() != m * k || y.len() != m {
        return Err(EngineError::precondition("matmul_f32: dimension mismatch"));
    }
    for row in 0..m {
        y[row] = dot(&weight[row * k..(row + 1) * k], x);
    }
    Ok(())
}

/// `f32 × Q8_0` matrix-vector product: each row is independently
/// dequantized from its Q8_0 blocks before the dot product.
pub fn matmul_q8_0(ctx: OpContext, weight_bytes: &[u8], x: &[f32], y: &mut [f32], m: usize, k: usize) -> Result<()> {
    matmul_qk(ctx, weight_bytes, GgmlType::Q8_0, x, y, m, k)
}
