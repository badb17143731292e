use super::scale_min_k4;
use crate::error::{EngineError, Result};

const QK_K: usize = 256;
const BLOCK_BYTES: usize = 2 + 2 + 12 + 32 + 128;

pub fn dequantize_q5_k(bytes: &[u8], n_elements: u64) -> Result<Vec<f32>> {
    if n_elements as usize % QK_K != 0 {
        return Err(EngineError::format("Q5_K row length must be a multiple of 256"));
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
    let qh = &block[16..48];
    let qs = &block[48..176];

    for sb in 0..8usize {
        let (sc, m) = scale_min_k4(sb, scales);
        let d1 = d * sc as f32;
        let m1 = dmin * m as f32;
        for l in 0..32usize {
            let idx = sb * 32 + l;
            let ql = if idx & 1 == 1 { (qs[idx / 2] >> 4) & 0xF } else { qs[idx / 2] & 0xF };
            let qh_bit = (qh[idx / 8] >> (idx & 7)) & 1;
            let qv = ql | (qh_bit << 4);
            y[idx] = d1 * qv as f32 - m1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(d: f32, dmin: f32, scales: [u8; 12], qh: [u8; 32], qs: [u8; 128]) -> Vec<u8> {
        let mut block = Vec::with_capacity(BLOCK_BYTES);
        block.extend_from_slice(&half::f16::from_f32(d).to_bits().to_le_bytes());
        block.extend_from_slice(&half::f16::from_f32(dmin).to_bits().to_le_bytes());
        block.extend_from_slice(&scales);
        block.extend_from_slice(&qh);
        block.extend_from_slice(&qs);
        block
    }

    #[test]
    fn high_bit_extends_nibble_to_five_bits() {
        let mut scales = [0u8; 12];
        scales[0] = 1; // sc = 1
        scales[4] = 0; // m = 0
        let mut qs = [0u8; 128];
        qs[0] = 0x0; // low nibble of value idx 0 = 0
        let mut qh = [0u8; 32];
        qh[0] = 0x1; // bit 0 set -> idx 0 gets high bit -> value = 16
        let block = make_block(3.0, 0.0, scales, qh, qs);
        let out = dequantize_q5_k(&block, 256).unwrap();
        // d1 = d*sc = 3, qv = 0 | (1<<4) = 16 -> y = 3*16 - 0 = 48
        assert!((out[0] - 48.0).abs() < 1e-3);
    }

    #[test]
    fn zero_input_yields_zero() {
        let block = make_block(1.0, 1.0, [0u8; 12], [0u8; 32], [0u8; 128]);
        let out = dequantize_q5_k(&block, 256).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
