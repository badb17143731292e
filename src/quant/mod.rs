//! K-quant dequantization codecs. Each codec is a pure function from raw
//! block bytes to `f32` values — no file I/O, no allocation beyond the
//! output vector, so they are exercised directly by unit tests with
//! hand-computed byte fixtures.

mod q4_k;
mod q5_k;
mod q6_k;
mod q8_0;

pub use q4_k::dequantize_q4_k;
pub use q5_k::dequantize_q5_k;
pub use q6_k::dequantize_q6_k;
pub use q8_0::{dequantize_q8_0, quantize_q8_0};

use crate::container::GgmlType;
use crate::error::{EngineError, Result};

/// Dequantize `n_elements` values of `dtype` out of `bytes` into a new
/// `Vec<f32>`. F32 is a byte-for-byte copy; F16 goes through `half`.
pub fn dequantize_row(dtype: GgmlType, bytes: &[u8], n_elements: u64) -> Result<Vec<f32>> {
    match dtype {
        GgmlType::F32 => {
            if bytes.len() < n_elements as usize * 4 {
                return Err(EngineError::BufferTooSmall { needed: n_elements as usize * 4, have: bytes.len() });
            }
            Ok(bytes[..n_elements as usize * 4]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect())
        }
        GgmlType::F16 => {
            if bytes.len() < n_elements as usize * 2 {
                return Err(EngineError::BufferTooSmall { needed: n_elements as usize * 2, have: bytes.len() });
            }
            Ok(bytes[..n_elements as usize * 2]
                .chunks_exact(2)
                .map(|c| half::f16::from_bits(u16::from_le_bytes(c.try_into().unwrap())).to_f32())
                .collect())
        }
        GgmlType::Q8_0 => dequantize_q8_0(bytes, n_elements),
        GgmlType::Q4K => dequantize_q4_k(bytes, n_elements),
        GgmlType::Q5K => dequantize_q5_k(bytes, n_elements),
        GgmlType::Q6K => dequantize_q6_k(bytes, n_elements),
        GgmlType::Unsupported(id) => Err(EngineError::format(format!("unsupported tensor dtype id {id}"))),
    }
}

/// Extracts the packed 6-bit scale/min pair for sub-block `j` (0..8) out of
/// a Q4_K/Q5_K block's 12-byte `scales` array. Sub-blocks 0..4 store their
/// 6-bit values directly; 4..8 reuse the high two bits of the first four
/// bytes plus the low nibble of their own paired byte.
pub(crate) fn scale_min_k4(j: usize, q: &[u8]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        let d = (q[j + 4] & 0xF) | ((q[j - 4] >> 6) << 4);
        let m = (q[j + 4] >> 4) | ((q[j] >> 6) << 4);
        (d, m)
    }
}
