use super::scale_min_k4;
use crate::error::{EngineError, Result};

const QK_K: usize = 256;
const BLOCK_BYTES: usize = 2 + 2 + 12 + 128;

/// Dequantize `n_elements` Q4_K values (must be a multiple of 256) out of
/// `bytes`, which must hold whole 144-byte blocks back to back.
pub fn dequantize_q4_k(bytes: &[u8], n_elements: u64) -> Result<Vec<f32>> {
    if n_elements as usize % QK_K != 0 {
        return Err(EngineError::format("Q4_K row length must be a multiple of 256"));
    }
    let nb = n_elements as usize / QK_K;
    let needed = nb * BLOCK_BYTES;
    if bytes.len() < needed {
        return Err(EngineError::BufferTooSmall { needed, have: bytes.len() });
    }
    let mut out = vec![0f32; n_elements as usize];
    for i in 0..nb {
        let block = &bytes[i * BLOCK_BYTES..(i + 1) * BLOCK_BYTES];
        dequantize_block(block, &mut out[i * QK_K..(i + 1) * QK_K]);
    }
    Ok(out)
}

fn dequantize_block(block: &[u8], y: &mut [f32]) {
    let d = half::f16::from_bits(u16::from_le_bytes([block[0], block[1]])).to_f32();
    let dmin = half::f16::from_bits(u16::from_le_bytes([block[2], block[3]])).to_f32();
    let scales = &block[4..16];
    let qs = &block[16..144];

    let mut is = 0usize;
    let mut q_off = 0usize;
    let mut y_off = 0usize;
    while q_off < 128 {
        let (sc1, m1) = scale_min_k4(is, scales);
        let d1 = d * sc1 as f32;
        let mm1 = dmin * m1 as f32;
        let (sc2, m2) = scale_min_k4(is + 1, scales);
        let d2 = d * sc2 as f32;
        let mm2 = dmin * m2 as f32;

        for l in 0..32 {
            y[y_off + l] = d1 * (qs[q_off + l] & 0xF) as f32 - mm1;
        }
        for l in 0..32 {
            y[y_off + 32 + l] = d2 * (qs[q_off + l] >> 4) as f32 - mm2;
        }
        q_off += 32;
        y_off += 64;
        is += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(d: f32, dmin: f32, scales: [u8; 12], qs: [u8; 128]) -> Vec<u8> {
        let mut block = Vec::with_capacity(BLOCK_BYTES);
        block.extend_from_slice(&half::f16::from_f32(d).to_bits().to_le_bytes());
        block.extend_from_slice(&half::f16::from_f32(dmin).to_bits().to_le_bytes());
        block.extend_from_slice(&scales);
        block.extend_from_slice(&qs);
        block
    }

    #[test]
    fn zero_scales_and_nibbles_yield_zero_minus_min_contribution() {
        // scales all zero -> sc=0, m=0 for every sub-block -> every output
        // value is d*0*nibble - dmin*0 == 0 regardless of qs bits.
        let block = make_block(1.5, 0.5, [0u8; 12], [0xFFu8; 128]);
        let out = dequantize_q4_k(&block, 256).unwrap();
        assert_eq!(out.len(), 256);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_nonzero_scale_and_nibble_matches_formula() {
        // sub-block 0: scales[0] = sc (low 6 bits), scales[4] = m (low 6 bits)
        let mut scales = [0u8; 12];
        scales[0] = 5; // sc for sub-block 0
        scales[4] = 3; // m for sub-block 0
        let mut qs = [0u8; 128];
        qs[0] = 0x0A; // low nibble = 10 (first value of sub-block 0)
        let block = make_block(2.0, 4.0, scales, qs);
        let out = dequantize_q4_k(&block, 256).unwrap();
        // d1 = d*sc = 2*5 = 10, m1 = dmin*m = 4*3 = 12
        // y[0] = d1 * nibble - m1 = 10*10 - 12 = 88
        assert!((out[0] - 88.0).abs() < 1e-3);
        // remaining nibbles in sub-block 0 are 0 -> y = -m1 = -12
        assert!((out[1] - (-12.0)).abs() < 1e-3);
    }

    #[test]
    fn rejects_non_multiple_of_256() {
        let block = vec![0u8; BLOCK_BYTES];
        assert!(dequantize_q4_k(&block, 255).is_err());
    }
}
