use crate::error::{EngineError, Result};

const QK_K: usize = 256;
const BLOCK_BYTES: usize = 128 + 64 + 16 + 2;

/// Q6_K stores its scale last in the block, unlike Q4_K/Q5_K where it
/// leads — `d` is read from the final two bytes.
pub fn dequantize_q6_k(bytes: &[u8], n_elements: u64) -> Result<Vec<f32>> {
    if n_elements as usize % QK_K != 0 {
        return Err(EngineError::format("Q6_K row length must be a multiple of 256"));
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
    let ql_all = &block[0..128];
    let qh_all = &block[128..192];
    let sc_all = &block[192..208];
    let d = half::f16::from_bits(u16::from_le_bytes([block[208], block[209]])).to_f32();

    for chunk in 0..2usize {
        let ql = &ql_all[chunk * 64..chunk * 64 + 64];
        let qh = &qh_all[chunk * 32..chunk * 32 + 32];
        let sc = &sc_all[chunk * 8..chunk * 8 + 8];
        let yb = &mut y[chunk * 128..chunk * 128 + 128];

        for l in 0..32usize {
            let is = l / 16;
            let q1 = (((ql[l] & 0xF) | (((qh[l] >> 0) & 3) << 4)) as i32 - 32) as f32;
            let q2 = (((ql[l + 32] & 0xF) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32) as f32;
            let q3 = (((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32) as f32;
            let q4 = (((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32) as f32;
            yb[l] = d * sc[is] as i8 as f32 * q1;
            yb[l + 32] = d * sc[is + 2] as i8 as f32 * q2;
            yb[l + 64] = d * sc[is + 4] as i8 as f32 * q3;
            yb[l + 96] = d * sc[is + 6] as i8 as f32 * q4;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(d: f32, ql: [u8; 128], qh: [u8; 64], scales: [i8; 16]) -> Vec<u8> {
        let mut block = Vec::with_capacity(BLOCK_BYTES);
        block.extend_from_slice(&ql);
        block.extend_from_slice(&qh);
        block.extend(scales.iter().map(|&s| s as u8));
        block.extend_from_slice(&half::f16::from_f32(d).to_bits().to_le_bytes());
        block
    }

    #[test]
    fn midpoint_code_with_zero_scale_is_zero() {
        // ql/qh all zero -> raw 6-bit code is 0 -> q = 0 - 32 = -32, but
        // scale 0 zeroes the contribution regardless.
        let block = make_block(1.0, [0u8; 128], [0u8; 64], [0i8; 16]);
        let out = dequantize_q6_k(&block, 256).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn known_code_and_scale_matches_formula() {
        let mut ql = [0u8; 128];
        let qh = [0u8; 64];
        let mut scales = [0i8; 16];
        // l=0: q1 raw code = ql[0]&0xF | (qh[0]>>0&3)<<4 = 0 -> q1 = -32
        // pick ql[0] nibble = 5 -> raw=5 -> q1 = 5-32 = -27
        ql[0] = 0x05;
        scales[0] = 2; // sc[is=0]
        let block = make_block(4.0, ql, qh, scales);
        let out = dequantize_q6_k(&block, 256).unwrap();
        // y[0] = d * sc[0] * q1 = 4 * 2 * (-27) = -216
        assert!((out[0] - (-216.0)).abs() < 1e-3);
    }
}
