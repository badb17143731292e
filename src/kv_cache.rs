//! Block-quantized key/value cache. Append-only per `(layer, position)`
//! store of Q8_0-encoded K/V vectors, with dequantized range readback.
//! Accessed only by the compute thread; needs no locking.

use crate::error::{EngineError, Result};
use crate::quant::{dequantize_q8_0, quantize_q8_0};

#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    pub n_layers: u32,
    pub n_kv_heads: u32,
    pub head_dim: u32,
    pub block_size: u32,
    pub max_seq_len: u32,
}

impl KvCacheConfig {
    fn vec_dim(&self) -> usize {
        (self.n_kv_heads * self.head_dim) as usize
    }
}

/// One fixed-size block of `block_size` token slots, K and V each stored
/// as Q8_0 rows of `vec_dim` values. Slots `[0, seq_len)` are valid;
/// slots beyond that are unspecified bytes, never read.
struct KvBlock {
    k: Vec<u8>,
    v: Vec<u8>,
    seq_len: u32,
}

impl KvBlock {
    fn new(block_size: u32, row_bytes: usize) -> Self {
        KvBlock { k: vec![0u8; block_size as usize * row_bytes], v: vec![0u8; block_size as usize * row_bytes], seq_len: 0 }
    }
}

pub struct KvCache {
    config: KvCacheConfig,
    row_bytes: usize,
    n_blocks_per_layer: u32,
    blocks: Vec<KvBlock>,
    layer_seq_len: Vec<u32>,
}

impl KvCache {
    pub fn new(config: KvCacheConfig) -> Result<Self> {
        if config.block_size == 0 || config.max_seq_len == 0 {
            return Err(EngineError::precondition("kv cache: block_size and max_seq_len must be nonzero"));
        }
        let vec_dim = config.vec_dim();
        let row_bytes = vec_dim.div_ceil(32) * 36; // Q8_0: 4-byte scale + 32 i8 per block
        let n_blocks_per_layer = config.max_seq_len.div_ceil(config.block_size);
        let n_blocks = config.n_layers as usize * n_blocks_per_layer as usize;
        let blocks = (0..n_blocks).map(|_| KvBlock::new(config.block_size, row_bytes)).collect();
        let layer_seq_len = vec![0u32; config.n_layers as usize];
        Ok(KvCache { config, row_bytes, n_blocks_per_layer, blocks, layer_seq_len })
    }

    fn block_index(&self, layer: u32, block_id: u32) -> usize {
        layer as usize * self.n_blocks_per_layer as usize + block_id as usize
    }

    /// Quantizes `k_f32`/`v_f32` (each `vec_dim` values) into the block at
    /// `pos`'s slot, updating both the block's and the layer's `seq_len`.
    pub fn append(&mut self, layer: u32, pos: u32, k_f32: &[f32], v_f32: &[f32]) -> Result<()> {
        if layer >= self.config.n_layers {
            return Err(EngineError::precondition("kv cache: layer out of range"));
        }
        if pos >= self.config.max_seq_len {
            return Err(EngineError::precondition("kv cache: pos exceeds max_seq_len"));
        }
        let vec_dim = self.config.vec_dim();
        if k_f32.len() != vec_dim || v_f32.len() != vec_dim {
            return Err(EngineError::precondition("kv cache: k/v length must equal n_kv_heads * head_dim"));
        }

        let block_id = pos / self.config.block_size;
        let slot = (pos % self.config.block_size) as usize;
        let row_bytes = self.row_bytes;
        let idx = self.block_index(layer, block_id);

        let k_row = quantize_q8_0(k_f32);
        let v_row = quantize_q8_0(v_f32);
        let block = &mut self.blocks[idx];
        block.k[slot * row_bytes..slot * row_bytes + k_row.len()].copy_from_slice(&k_row);
        block.v[slot * row_bytes..slot * row_bytes + v_row.len()].copy_from_slice(&v_row);
        block.seq_len = block.seq_len.max(slot as u32 + 1);

        let layer_len = &mut self.layer_seq_len[layer as usize];
        *layer_len = (*layer_len).max(pos + 1);
        Ok(())
    }

    /// Dequantizes positions `[start, end)` into `k_out`/`v_out`, each
    /// sized `(end - start) * vec_dim`, in position order.
    pub fn read_range(&self, layer: u32, start: u32, end: u32, k_out: &mut [f32], v_out: &mut [f32]) -> Result<()> {
        if layer >= self.config.n_layers {
            return Err(EngineError::precondition("kv cache: layer out of range"));
        }
        if end > self.config.max_seq_len || start > end {
            return Err(EngineError::precondition("kv cache: read_range out of bounds"));
        }
        let vec_dim = self.config.vec_dim();
        let expected = (end - start) as usize * vec_dim;
        if k_out.len() != expected || v_out.len() != expected {
            return Err(EngineError::precondition("kv cache: out buffer length must equal (end-start) * vec_dim"));
        }

        for pos in start..end {
            let block_id = pos / self.config.block_size;
            let slot = (pos % self.config.block_size) as usize;
            let idx = self.block_index(layer, block_id);
            let block = &self.blocks[idx];
            let row_bytes = self.row_bytes;
            let k_row = dequantize_q8_0(&block.k[slot * row_bytes..(slot + 1) * row_bytes], vec_dim as u64)?;
            let v_row = dequantize_q8_0(&block.v[slot * row_bytes..(slot + 1) * row_bytes], vec_dim as u64)?;
            let out_off = (pos - start) as usize * vec_dim;
            k_out[out_off..out_off + vec_dim].copy_from_slice(&k_row);
            v_out[out_off..out_off + vec_dim].copy_from_slice(&v_row);
        }
        Ok(())
    }

    /// Resets populated-length counters; storage bytes are left as-is.
    pub fn clear(&mut self) {
        for block in &mut self.blocks {
            block.seq_len = 0;
        }
        for len in &mut self.layer_seq_len {
            *len = 0;
        }
    }

    pub fn get_seq_len(&self, layer: u32) -> u32 {
        self.layer_seq_len.get(layer as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> KvCacheConfig {
        KvCacheConfig { n_layers: 1, n_kv_heads: 2, head_dim: 4, block_size: 4, max_seq_len: 8 }
    }

    #[test]
    fn round_trip_within_quantization_error_and_clear_resets() {
        let mut cache = KvCache::new(cfg()).unwrap();
        let vec_dim = 8;
        for t in 0..4u32 {
            let k: Vec<f32> = (0..vec_dim).map(|i| 0.1 * (10 * t + i as u32) as f32).collect();
            let v: Vec<f32> = (0..vec_dim).map(|i| -0.1 * (10 * t + i as u32) as f32).collect();
            cache.append(0, t, &k, &v).unwrap();
        }
        assert_eq!(cache.get_seq_len(0), 4);

        // All 4 appended positions share one block (block_size == 4), so
        // this also exercises every non-zero slot's indexing, not just
        // slot 0.
        let mut k_out = vec![0.0f32; 4 * vec_dim];
        let mut v_out = vec![0.0f32; 4 * vec_dim];
        cache.read_range(0, 0, 4, &mut k_out, &mut v_out).unwrap();
        for t in 0..4u32 {
            for i in 0..vec_dim {
                let expected_k = 0.1 * (10 * t + i as u32) as f32;
                let expected_v = -0.1 * (10 * t + i as u32) as f32;
                let out_off = t as usize * vec_dim + i;
                assert!(
                    (k_out[out_off] - expected_k).abs() < 0.05,
                    "k[{t}][{i}]={} expected {}",
                    k_out[out_off],
                    expected_k
                );
                assert!(
                    (v_out[out_off] - expected_v).abs() < 0.05,
                    "v[{t}][{i}]={} expected {}",
                    v_out[out_off],
                    expected_v
                );
            }
        }

        cache.clear();
        assert_eq!(cache.get_seq_len(0), 0);
    }

    #[test]
    fn read_range_rejects_past_max_seq_len() {
        let cache = KvCache::new(cfg()).unwrap();
        let mut k_out = vec![0.0f32; 8];
        let mut v_out = vec![0.0f32; 8];
        assert!(cache.read_range(0, 0, 9, &mut k_out, &mut v_out).is_err());
    }

    #[test]
    fn rejects_zero_block_size() {
        let mut bad = cfg();
        bad.block_size = 0;
        assert!(KvCache::new(bad).is_err());
    }
}
