//! Token embedding lookup: gather-and-dequantize one row per token id
//! from the embedding table.

use super::OpContext;
use crate::container::GgmlType;
use crate::error::{EngineError, Result};
use crate::quant::dequantize_row;

/// Writes `tokens.len() * n_embd` values into `out`, one dequantized
/// `n_embd`-wide row per token. Supported table dtypes: F16, F32, Q8_0,
/// Q4_K (the set the GGUF ecosystem actually uses for embedding tables).
pub fn embed(
    _ctx: OpContext,
    table_bytes: &[u8],
    dtype: GgmlType,
    tokens: &[u32],
    out: &mut [f32],
    n_embd: usize,
) -> Result<()> {
    if !matches!(dtype, GgmlType::F16 | GgmlType::F32 | GgmlType::Q8_0 | GgmlType::Q4K) {
        return Err(EngineError::format(format!("embed: unsupported table dtype {dtype:?}")));
    }
    if out.len() != tokens.len() * n_embd {
        return Err(EngineError::precondition("embed: out length must equal tokens.len() * n_embd"));
    }
    let row_bytes = dtype.row_byte_size(n_embd as u64) as usize;
    for (i, &tok) in tokens.iter().enumerate() {
        let start = tok as usize * row_bytes;
        let end = start + row_bytes;
        if end > table_bytes.len() {
            return Err(EngineError::precondition(format!("embed: token {tok} out of table range")));
        }
        let row = dequantize_row(dtype, &table_bytes[start..end], n_embd as u64)?;
        out[i * n_embd..(i + 1) * n_embd].copy_from_slice(&row);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_f16_rows_in_token_order() {
        let n_embd = 4;
        let vocab = 4;
        let mut table = Vec::new();
        for i in 0..(n_embd * vocab) {
            table.extend_from_slice(&half::f16::from_f32(0.1 * i as f32).to_bits().to_le_bytes());
        }
        let tokens = vec![1u32, 3];
        let mut out = vec![0.0f32; tokens.len() * n_embd];
        embed(OpContext::default(), &table, GgmlType::F16, &tokens, &mut out, n_embd).unwrap();
        assert!((out[0] - 0.4).abs() < 0.01);
        assert!((out[3] - 0.7).abs() < 0.01);
        assert!((out[4] - 1.2).abs() < 0.01);
        assert!((out[7] - 1.5).abs() < 0.01);
    }

    #[test]
    fn rejects_token_past_table_end() {
        let n_embd = 4;
        let table = vec![0u8; n_embd * 2 * 2]; // 2 rows of F16
        let tokens = vec![5u32];
        let mut out = vec![0.0f32; n_embd];
        assert!(embed(OpContext::default(), &table, GgmlType::F16, &tokens, &mut out, n_embd).is_err());
    }
}
