use crate::error::{EngineError, Result};

const BLOCK_VALUES: usize = 32;
const BLOCK_BYTES: usize = 4 + 32;

/// Dequantize `n_elements` Q8_0 values out of `bytes` (32-value blocks of
/// `f32 scale` followed by `i8[32]`). `n_elements` need not be a multiple
/// of 32; the final partial block is truncated to the requested length.
pub fn dequantize_q8_0(bytes: &[u8], n_elements: u64) -> Result<Vec<f32>> {
    let n = n_elements as usize;
    let nb = n.div_ceil(BLOCK_VALUES);
    let needed = nb * BLOCK_BYTES;
    if bytes.len() < needed {
        return Err(EngineError::BufferTooSmall { needed, have: bytes.len() });
    }
    let mut out = vec![0f32; n];
    for b in 0..nb {
        let block = &bytes[b * BLOCK_BYTES..(b + 1) * BLOCK_BYTES];
        let scale = f32::from_le_bytes(block[0..4].try_into().unwrap());
        let base = b * BLOCK_VALUES;
        for i in 0..BLOCK_VALUES {
            let idx = base + i;
            if idx < n {
                out[idx] = block[4 + i] as i8 as f32 * scale;
            }
        }
    }
    Ok(out)
}

/// Quantize `x` into Q8_0 blocks. Each 32-value block gets its own scale,
/// `max_abs / 127` (or `1.0` for an all-zero block), values rounded and
/// clamped to `[-127, 127]`.
pub fn quantize_q8_0(x: &[f32]) -> Vec<u8> {
    let n = x.len();
    let nb = n.div_ceil(BLOCK_VALUES);
    let mut out = Vec::with_capacity(nb * BLOCK_BYTES);
    for b in 0..nb {
        let base = b * BLOCK_VALUES;
        let mut max_abs = 0f32;
        for i in 0..BLOCK_VALUES {
            let idx = base + i;
            let v = if idx < n { x[idx] } else { 0.0 };
            max_abs = max_abs.max(v.abs());
        }
        let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 127.0 };
        out.extend_from_slice(&scale.to_le_bytes());
        for i in 0..BLOCK_VALUES {
            let idx = base + i;
            let v = if idx < n { x[idx] } else { 0.0 };
            let q = (v / scale).round().clamp(-127.0, 127.0) as i8;
            out.push(q as u8);
        }
    }
    out
}
