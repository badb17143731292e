//! Engine (C8): drives prefill and decode over the streaming layer
//! pipeline, tying the tensor map, model loader, prefetcher, KV cache,
//! tokenizer, and operators together.

use std::sync::Arc;

use log::{debug, info};

use crate::config::EngineConfig;
use crate::container::GgufContainer;
use crate::error::{EngineError, Result};
use crate::kv_cache::{KvCache, KvCacheConfig};
use crate::model_loader::ResidentTensors;
use crate::ops::{self, OpContext};
use crate::prefetcher::{PrefetchStats, Prefetcher};
use crate::tensor_map::TensorMap;
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub n_layers: u32,
    pub n_vocab: u32,
    pub n_embd: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub head_dim: u32,
    pub rope_theta: f32,
}

impl ModelInfo {
    fn from_container(container: &GgufContainer, n_vocab: usize) -> Result<Self> {
        let n_layers = container
            .get_u32("llama.block_count")
            .ok_or_else(|| EngineError::format("missing llama.block_count"))?;
        let n_embd = container
            .get_u32("llama.embedding_length")
            .ok_or_else(|| EngineError::format("missing llama.embedding_length"))?;
        let n_heads = container
            .get_u32("llama.attention.head_count")
            .ok_or_else(|| EngineError::format("missing llama.attention.head_count"))?;
        let n_kv_heads = container.get_u32("llama.attention.head_count_kv").unwrap_or(n_heads);
        if n_heads == 0 || n_embd % n_heads != 0 {
            return Err(EngineError::format("llama.embedding_length is not a multiple of head_count"));
        }
        let head_dim = n_embd / n_heads;
        let rope_theta = container.get_f32("llama.rope.freq_base").unwrap_or(10000.0);

        Ok(ModelInfo { n_layers, n_vocab: n_vocab as u32, n_embd, n_heads, n_kv_heads, head_dim, rope_theta })
    }
}

pub struct GenerationOutput {
    pub tokens: Vec<u32>,
    pub text: String,
}

/// `ffn_gate` is `[d_ff, d_in]` row-major; its element count divided by
/// `d_in` recovers `d_ff` regardless of dtype or block size, the robust
/// alternative to the Q4_K-specific byte-size heuristic.
fn infer_d_ff(ffn_gate_dims: &[u64], d_in: usize) -> Result<usize> {
    let total: u64 = ffn_gate_dims.iter().product();
    if d_in == 0 || total % d_in as u64 != 0 {
        return Err(EngineError::format("ffn_gate dims are not a multiple of n_embd"));
    }
    Ok((total / d_in as u64) as usize)
}

pub struct Engine {
    container: Arc<GgufContainer>,
    tensor_map: Arc<TensorMap>,
    resident: ResidentTensors,
    info: ModelInfo,
    tokenizer: Tokenizer,
    kv_cache: KvCache,
    prefetcher: Prefetcher,
    prompt: String,
    ctx: OpContext,
    depth: u32,
}

impl Engine {
    pub fn open(model_path: &str, cfg: &EngineConfig) -> Result<Self> {
        info!("opening model {model_path}");
        let container = Arc::new(GgufContainer::open(model_path, cfg.use_mmap)?);
        let tensor_map = Arc::new(TensorMap::build(&container)?);

        let n_embd = container
            .get_u32("llama.embedding_length")
            .ok_or_else(|| EngineError::format("missing llama.embedding_length"))? as usize;
        info!("loading resident tensors");
        let resident = ResidentTensors::load(&container, &tensor_map.resident, n_embd)?;
        let info = ModelInfo::from_container(&container, resident.n_vocab)?;

        let tokenizer = Tokenizer::from_container(&container);

        let kv_cache = KvCache::new(KvCacheConfig {
            n_layers: info.n_layers,
            n_kv_heads: info.n_kv_heads,
            head_dim: info.head_dim,
            block_size: cfg.kv_block_size,
            max_seq_len: cfg.max_seq_len as u32,
        })?;

        let depth = cfg.prefetch_depth.max(1);
        let max_layer_size = tensor_map.max_layer_size() + 9 * 32;
        let prefetcher = Prefetcher::new(container.clone(), tensor_map.clone(), depth, max_layer_size);

        info!(
            "model ready: {} layers, n_embd={}, n_heads={}, n_kv_heads={}, n_vocab={}",
            info.n_layers, info.n_embd, info.n_heads, info.n_kv_heads, info.n_vocab
        );

        Ok(Engine {
            container,
            tensor_map,
            resident,
            info,
            tokenizer,
            kv_cache,
            prefetcher,
            prompt: String::new(),
            ctx: OpContext::default(),
            depth,
        })
    }

    pub fn set_prompt(&mut self, text: &str) {
        self.prompt = text.to_string();
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn prefetch_stats(&self) -> PrefetchStats {
        self.prefetcher.stats()
    }

    /// Runs prefill over the stored prompt, then decodes up to
    /// `max_tokens` new tokens via argmax sampling.
    pub fn generate(&mut self, max_tokens: u32) -> Result<GenerationOutput> {
        self.kv_cache.clear();

        let mut prompt_tokens = self.tokenizer.encode(&self.prompt);
        if prompt_tokens.is_empty() {
            prompt_tokens.push(1);
        }

        let n_embd = self.info.n_embd as usize;
        let mut hidden = vec![0.0f32; n_embd];
        let mut pos: u32 = 0;
        let mut generated = Vec::new();

        info!("prefill: {} prompt tokens", prompt_tokens.len());
        for &tok in &prompt_tokens {
            self.embed_token(tok, &mut hidden)?;
            self.run_layer_sweep(pos, &mut hidden)?;
            pos += 1;
        }

        info!("decode: up to {max_tokens} tokens");
        for step in 0..max_tokens {
            let next = self.project_and_sample(&hidden)?;
            generated.push(next);
            debug!("decode step {step}: token {next} at pos {pos}");

            self.embed_token(next, &mut hidden)?;
            self.run_layer_sweep(pos, &mut hidden)?;
            pos += 1;
        }

        let text = self.tokenizer.decode(&generated);
        Ok(GenerationOutput { tokens: generated, text })
    }

    fn embed_token(&self, token: u32, hidden: &mut [f32]) -> Result<()> {
        ops::embed(
            self.ctx,
            &self.resident.token_embd_bytes,
            self.resident.token_embd_dtype,
            &[token],
            hidden,
            self.info.n_embd as usize,
        )
    }

    fn project_and_sample(&self, hidden: &[f32]) -> Result<u32> {
        let n_embd = self.info.n_embd as usize;
        let mut normed = vec![0.0f32; n_embd];
        ops::rmsnorm(hidden, &self.resident.output_norm, 1e-5, &mut normed)?;

        let n_vocab = self.info.n_vocab as usize;
        let mut logits = vec![0.0f32; n_vocab];
        ops::matmul::matmul_qk(
            self.ctx,
            &self.resident.lm_head_bytes,
            self.resident.lm_head_dtype,
            &normed,
            &mut logits,
            n_vocab,
            n_embd,
        )?;

        let (best_idx, _) =
            logits.iter().enumerate().fold((0usize, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        Ok(best_idx as u32)
    }

    /// Requests layers `0..depth` ahead of time, then walks the layer
    /// sweep in order: wait for `ℓ`, request `ℓ + depth` if any remain,
    /// run `forward_layer`, release.
    fn run_layer_sweep(&mut self, pos: u32, hidden: &mut [f32]) -> Result<()> {
        let n_layers = self.info.n_layers;
        let depth = self.depth;

        let mut handles = Vec::new();
        for layer in 0..depth.min(n_layers) {
            match self.prefetcher.request(layer) {
                Some(h) => handles.push(h),
                None => return Err(EngineError::format("prefetcher pool exhausted at sweep start")),
            }
        }

        for layer in 0..n_layers {
            let handle = handles.remove(0);
            let next_to_request = layer + depth;
            let guard = match self.prefetcher.wait(handle) {
                Some(g) => g,
                None => return Err(EngineError::format(format!("layer {layer} failed to load"))),
            };

            let view = *guard.view.as_ref().ok_or_else(|| EngineError::format("ready buffer missing view"))?;
            let gate_dims = self
                .tensor_map
                .layers
                .get(layer as usize)
                .map(|l| l.ffn_gate.dims.clone())
                .ok_or_else(|| EngineError::format(format!("layer {layer} out of range")))?;
            let result =
                Self::forward_layer(self.ctx, &mut self.kv_cache, &self.info, &gate_dims, &view, &guard.data, layer, pos, hidden);
            self.prefetcher.release(guard);
            result?;

            if next_to_request < n_layers {
                match self.prefetcher.request(next_to_request) {
                    Some(h) => handles.push(h),
                    None => return Err(EngineError::format("prefetcher pool exhausted mid-sweep")),
                }
            }
        }
        Ok(())
    }

    /// Free of `&self`/`&mut self` on purpose: `run_layer_sweep` calls this
    /// while still holding a `MutexGuard` borrowed from `self.prefetcher`,
    /// so this only takes the specific fields it needs (`kv_cache`, `ctx`,
    /// `info`, the current layer's `ffn_gate` dims) rather than all of
    /// `Engine`, keeping that borrow disjoint from the prefetcher's.
    #[allow(clippy::too_many_arguments)]
    fn forward_layer(
        ctx: OpContext,
        kv_cache: &mut KvCache,
        info: &ModelInfo,
        gate_dims: &[u64],
        view: &crate::layer_buffer::LayerView,
        data: &[u8],
        layer: u32,
        pos: u32,
        hidden: &mut [f32],
    ) -> Result<()> {
        let n_embd = info.n_embd as usize;
        let n_heads = info.n_heads as usize;
        let n_kv_heads = info.n_kv_heads as usize;
        let head_dim = info.head_dim as usize;

        let mut normed = vec![0.0f32; n_embd];
        let attn_norm_w = dequant_f32(view.attn_norm(data), view.dtype(crate::layer_buffer::ATTN_NORM), n_embd)?;
        ops::rmsnorm(hidden, &attn_norm_w, 1e-5, &mut normed)?;

        let q_dim = n_heads * head_dim;
        let kv_dim = n_kv_heads * head_dim;
        let mut q = vec![0.0f32; q_dim];
        let mut k = vec![0.0f32; kv_dim];
        let mut v = vec![0.0f32; kv_dim];
        ops::matmul::matmul_qk(ctx, view.attn_q(data), view.dtype(crate::layer_buffer::ATTN_Q), &normed, &mut q, n_heads * head_dim, n_embd)?;
        ops::matmul::matmul_qk(ctx, view.attn_k(data), view.dtype(crate::layer_buffer::ATTN_K), &normed, &mut k, n_kv_heads * head_dim, n_embd)?;
        ops::matmul::matmul_qk(ctx, view.attn_v(data), view.dtype(crate::layer_buffer::ATTN_V), &normed, &mut v, n_kv_heads * head_dim, n_embd)?;

        ops::rope(&mut q, info.n_heads, info.head_dim, pos, info.rope_theta)?;
        ops::rope(&mut k, info.n_kv_heads, info.head_dim, pos, info.rope_theta)?;

        kv_cache.append(layer, pos, &k, &v)?;
        let seq_len = pos + 1;
        let mut k_hist = vec![0.0f32; seq_len as usize * kv_dim];
        let mut v_hist = vec![0.0f32; seq_len as usize * kv_dim];
        kv_cache.read_range(layer, 0, seq_len, &mut k_hist, &mut v_hist)?;

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut attn_out = vec![0.0f32; q_dim];
        ops::attention(ctx, &q, &k_hist, &v_hist, &mut attn_out, info.n_heads, info.n_kv_heads, info.head_dim, seq_len, scale, None)?;

        let mut attn_proj = vec![0.0f32; n_embd];
        ops::matmul::matmul_qk(ctx, view.attn_o(data), view.dtype(crate::layer_buffer::ATTN_O), &attn_out, &mut attn_proj, n_embd, q_dim)?;
        for (h, p) in hidden.iter_mut().zip(attn_proj.iter()) {
            *h += p;
        }

        let mut normed2 = vec![0.0f32; n_embd];
        let ffn_norm_w = dequant_f32(view.ffn_norm(data), view.dtype(crate::layer_buffer::FFN_NORM), n_embd)?;
        ops::rmsnorm(hidden, &ffn_norm_w, 1e-5, &mut normed2)?;

        let gate_dtype = view.dtype(crate::layer_buffer::FFN_GATE);
        let d_ff = infer_d_ff(gate_dims, n_embd)?;
        let mut mlp_out = vec![0.0f32; n_embd];
        ops::mlp_swiglu(
            ctx,
            &normed2,
            view.ffn_gate(data),
            gate_dtype,
            view.ffn_up(data),
            view.dtype(crate::layer_buffer::FFN_UP),
            view.ffn_down(data),
            view.dtype(crate::layer_buffer::FFN_DOWN),
            &mut mlp_out,
            n_embd,
            d_ff,
        )?;
        for (h, m) in hidden.iter_mut().zip(mlp_out.iter()) {
            *h += m;
        }
        Ok(())
    }
}

/// Dequantizes an RMSNorm weight row (F32/F16/Q8_0 -- norm weights are
/// never k-quantized in practice, but this stays dtype-general).
fn dequant_f32(bytes: &[u8], dtype: crate::container::GgmlType, n: usize) -> Result<Vec<f32>> {
    crate::quant::dequantize_row(dtype, bytes, n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    /// A tiny two-layer, all-F32 checkpoint: `n_embd=8, n_heads=n_kv_heads=2,
    /// head_dim=4, d_ff=8, n_vocab=6`, zero-filled weights, and a six-piece
    /// vocabulary with no BOS token. Small enough that every dimension used
    /// in `forward_layer` (q/k/v, attn_o, ffn_gate/up/down) can be hand-laid
    /// out and checked against `GgmlType::F32`'s `row_byte_size(n) == n * 4`.
    fn write_engine_test_gguf(n_layers: u32) -> std::path::PathBuf {
        let n_embd: u64 = 8;
        let n_heads: u32 = 2;
        let n_kv_heads: u32 = 2;
        let n_vocab: u64 = 6;

        let dir = std::env::temp_dir();
        let path = dir.join(format!("engine_test_{}_{}.gguf", std::process::id(), n_layers));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"GGUF").unwrap();
        f.write_all(&3u32.to_le_bytes()).unwrap();

        let n_tensors: i64 = 3 + 9 * n_layers as i64;
        f.write_all(&n_tensors.to_le_bytes()).unwrap();
        f.write_all(&5i64.to_le_bytes()).unwrap();

        let write_kv_u32 = |f: &mut std::fs::File, key: &str, val: u32| {
            f.write_all(&(key.len() as u64).to_le_bytes()).unwrap();
            f.write_all(key.as_bytes()).unwrap();
            f.write_all(&4u32.to_le_bytes()).unwrap();
            f.write_all(&val.to_le_bytes()).unwrap();
        };
        write_kv_u32(&mut f, "llama.block_count", n_layers);
        write_kv_u32(&mut f, "llama.embedding_length", n_embd as u32);
        write_kv_u32(&mut f, "llama.attention.head_count", n_heads);
        write_kv_u32(&mut f, "llama.attention.head_count_kv", n_kv_heads);

        let vocab = ["<unk>", "a", "b", "c", "d", "e"];
        let key = "tokenizer.ggml.tokens";
        f.write_all(&(key.len() as u64).to_le_bytes()).unwrap();
        f.write_all(key.as_bytes()).unwrap();
        f.write_all(&9u32.to_le_bytes()).unwrap(); // array
        f.write_all(&8u32.to_le_bytes()).unwrap(); // elem kind: string
        f.write_all(&(vocab.len() as u64).to_le_bytes()).unwrap();
        for tok in vocab {
            f.write_all(&(tok.len() as u64).to_le_bytes()).unwrap();
            f.write_all(tok.as_bytes()).unwrap();
        }

        let mut offset = 0u64;
        let mut write_tensor = |f: &mut std::fs::File, name: &str, dims: &[u64]| {
            f.write_all(&(name.len() as u64).to_le_bytes()).unwrap();
            f.write_all(name.as_bytes()).unwrap();
            f.write_all(&(dims.len() as u32).to_le_bytes()).unwrap();
            for d in dims {
                f.write_all(&d.to_le_bytes()).unwrap();
            }
            f.write_all(&0u32.to_le_bytes()).unwrap(); // dtype F32
            f.write_all(&offset.to_le_bytes()).unwrap();
            let elems: u64 = dims.iter().product();
            offset += elems * 4;
        };

        write_tensor(&mut f, "token_embd.weight", &[n_embd, n_vocab]);
        write_tensor(&mut f, "output_norm.weight", &[n_embd]);
        write_tensor(&mut f, "output.weight", &[n_vocab, n_embd]);

        let head_dim = n_embd / n_heads as u64;
        let q_dim = n_heads as u64 * head_dim;
        let kv_dim = n_kv_heads as u64 * head_dim;
        let d_ff = n_embd;

        for layer in 0..n_layers {
            write_tensor(&mut f, &format!("blk.{layer}.attn_norm.weight"), &[n_embd]);
            write_tensor(&mut f, &format!("blk.{layer}.attn_q.weight"), &[n_embd, q_dim]);
            write_tensor(&mut f, &format!("blk.{layer}.attn_k.weight"), &[n_embd, kv_dim]);
            write_tensor(&mut f, &format!("blk.{layer}.attn_v.weight"), &[n_embd, kv_dim]);
            write_tensor(&mut f, &format!("blk.{layer}.attn_output.weight"), &[q_dim, n_embd]);
            write_tensor(&mut f, &format!("blk.{layer}.ffn_norm.weight"), &[n_embd]);
            write_tensor(&mut f, &format!("blk.{layer}.ffn_gate.weight"), &[n_embd, d_ff]);
            write_tensor(&mut f, &format!("blk.{layer}.ffn_up.weight"), &[n_embd, d_ff]);
            write_tensor(&mut f, &format!("blk.{layer}.ffn_down.weight"), &[d_ff, n_embd]);
        }

        let pos = f.stream_position().unwrap();
        let aligned = (pos + 31) / 32 * 32;
        f.write_all(&vec![0u8; (aligned - pos) as usize]).unwrap();
        f.write_all(&vec![0u8; offset as usize]).unwrap();
        path
    }

    /// Streaming invariant (every position reloads every layer with no
    /// cross-position cache) plus determinism: two `generate` calls over
    /// the same prompt and weights produce identical token sequences.
    #[test]
    fn generate_reloads_every_layer_per_position_and_is_deterministic() {
        let n_layers = 2u32;
        let path = write_engine_test_gguf(n_layers);

        let mut cfg = EngineConfig::default();
        cfg.prefetch_depth = 2;

        let mut engine = Engine::open(path.to_str().unwrap(), &cfg).unwrap();
        engine.set_prompt("ab");
        let max_tokens: u32 = 3;

        let first = engine.generate(max_tokens).unwrap();
        let stats = engine.prefetch_stats();

        // "ab" has no whitespace and matches "a"/"b" exactly against this
        // six-piece vocabulary with no BOS configured, so prefill sees
        // exactly two positions.
        let prompt_len: u64 = 2;
        let positions = prompt_len + max_tokens as u64;
        assert_eq!(stats.layer_loads, n_layers as u64 * positions);
        assert!(stats.max_concurrent_buffers <= cfg.prefetch_depth);

        engine.set_prompt("ab");
        let second = engine.generate(max_tokens).unwrap();
        assert_eq!(first.tokens, second.tokens);

        std::fs::remove_file(&path).ok();
    }
}
