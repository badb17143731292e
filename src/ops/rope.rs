//! Rotary position embedding. Applied in place over a flat `[n_heads *
//! head_dim]` vector of query or key activations, one head at a time.

use crate::error::{EngineError, Result};

/// Rotates each head's channel pairs `(2i, 2i+1)` by `pos * theta^(-2i/head_dim)`.
/// If `head_dim` is odd, the trailing unpaired lane is left unchanged.
pub fn rope(vec: &mut [f32], n_heads: u32, head_dim: u32, pos: u32, theta: f32) -> Result<()> {
    let n_heads = n_heads as usize;
    let head_dim = head_dim as usize;
    if vec.len() != n_heads * head_dim {
        return Err(EngineError::precondition("rope: vector length must equal n_heads * head_dim"));
    }
    let n_pairs = head_dim / 2;
    for h in 0..n_heads {
        let head = &mut vec[h * head_dim..(h + 1) * head_dim];
        for i in 0..n_pairs {
            let freq = theta.powf(-2.0 * (i as f32) / (head_dim as f32));
            let angle = (pos as f32) * freq;
            let (sin_a, cos_a) = angle.sin_cos();
            let x0 = head[2 * i];
            let x1 = head[2 * i + 1];
            head[2 * i] = x0 * cos_a - x1 * sin_a;
            head[2 * i + 1] = x0 * sin_a + x1 * cos_a;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_head_rotation_matches_formula() {
        let mut v = vec![1.0, 0.0];
        rope(&mut v, 1, 2, 1, 10000.0).unwrap();
        // freq = theta^0 = 1, angle = pos*1 = 1
        assert!((v[0] - 1.0f32.cos()).abs() < 1e-5);
        assert!((v[1] - 1.0f32.sin()).abs() < 1e-5);
    }

    #[test]
    fn odd_head_dim_leaves_trailing_lane_untouched() {
        let mut v = vec![1.0, 0.0, 5.0];
        rope(&mut v, 1, 3, 1, 10000.0).unwrap();
        assert_eq!(v[2], 5.0);
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut v = vec![1.0, 2.0, 3.0];
        assert!(rope(&mut v, 1, 4, 1, 10000.0).is_err());
    }
}
