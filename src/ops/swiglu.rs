//! SwiGLU feed-forward block: `down(silu(gate(x)) * up(x))`.

use super::matmul::matmul_qk;
use super::OpContext;
use crate::container::GgmlType;
use crate::error::{EngineError, Result};

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Computes the full SwiGLU MLP: `g = Wg*x`, `u = Wu*x`,
/// `h_i = silu(g_i) * u_i`, `y = Wd*h`. `Wg`/`Wu` are `[d_ff, d_in]`
/// row-major; `Wd` is `[d_in, d_ff]` row-major.
#[allow(clippy::too_many_arguments)]
pub fn mlp_swiglu(
    ctx: OpContext,
    x: &[f32],
    gate_bytes: &[u8],
    gate_dtype: GgmlType,
    up_bytes: &[u8],
    up_dtype: GgmlType,
    down_bytes: &[u8],
    down_dtype: GgmlType,
    y: &mut [f32],
    d_in: usize,
    d_ff: usize,
) -> Result<()> {
    if x.len() != d_in || y.len() != d_in {
        return Err(EngineError::precondition("mlp_swiglu: x/y length must equal d_in"));
    }
    let mut g = vec![0.0f32; d_ff];
    let mut u = vec![0.0f32; d_ff];
    matmul_qk(ctx, gate_bytes, gate_dtype, x, &mut g, d_ff, d_in)?;
    matmul_qk(ctx, up_bytes, up_dtype, x, &mut u, d_ff, d_in)?;

    let mut h = vec![0.0f32; d_ff];
    for i in 0..d_ff {
        h[i] = silu(g[i]) * u[i];
    }
    matmul_qk(ctx, down_bytes, down_dtype, &h, y, d_in, d_ff)
}
