//! Model Loader (C6): holds the resident tensors loaded once at open, and
//! a reusable I/O staging buffer used to materialize one transformer
//! layer's weights into a caller-supplied pool buffer per `load_layer`
//! call.

use std::sync::Arc;

use crate::container::GgufContainer;
use crate::error::{EngineError, Result};
use crate::layer_buffer::{LayerBuffer, LayerView, TensorSlot, N_LAYER_TENSORS};
use crate::quant::dequantize_row;
use crate::tensor_map::TensorMap;

const TENSOR_ALIGNMENT: usize = 32;

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) / align * align
}

/// Resident tensors (token embedding, final norm, LM head), loaded once
/// at model open and read many times thereafter. `open` owns them; the
/// engine only borrows.
pub struct ResidentTensors {
    pub token_embd_bytes: Vec<u8>,
    pub token_embd_dtype: crate::container::GgmlType,
    pub n_vocab: usize,
    pub n_embd: usize,
    /// Final output norm weight, dequantized to f32 -- its precision
    /// matters the way any RMSNorm weight's does, and it is small.
    pub output_norm: Vec<f32>,
    pub lm_head_bytes: Vec<u8>,
    pub lm_head_dtype: crate::container::GgmlType,
}

impl ResidentTensors {
    pub fn load(container: &GgufContainer, spec: &crate::tensor_map::ResidentSpec, n_embd: usize) -> Result<Self> {
        let token_embd_bytes = container.read_span(spec.token_embd.offset, spec.token_embd.size)?;
        let token_embd_dtype = spec.token_embd.dtype;
        let n_vocab_elems = spec.token_embd.dims.iter().product::<u64>();
        if n_embd == 0 || n_vocab_elems % n_embd as u64 != 0 {
            return Err(EngineError::format("token_embd dims are not a multiple of n_embd"));
        }
        let n_vocab = (n_vocab_elems / n_embd as u64) as usize;

        let norm_bytes = container.read_span(spec.output_norm.offset, spec.output_norm.size)?;
        let output_norm = dequantize_row(spec.output_norm.dtype, &norm_bytes, n_embd as u64)?;

        let lm_head_bytes = container.read_span(spec.lm_head.offset, spec.lm_head.size)?;
        let lm_head_dtype = spec.lm_head.dtype;

        Ok(ResidentTensors { token_embd_bytes, token_embd_dtype, n_vocab, n_embd, output_norm, lm_head_bytes, lm_head_dtype })
    }
}

/// Streams one transformer block's weights at a time off disk into a
/// caller-owned pool buffer. Not `Sync`: the prefetcher's single worker
/// thread owns the only instance.
pub struct ModelLoader {
    container: Arc<GgufContainer>,
    tensor_map: Arc<TensorMap>,
    staging: Vec<u8>,
    pub layer_loads: u64,
    pub layer_bytes_read: u64,
}

impl ModelLoader {
    pub fn new(container: Arc<GgufContainer>, tensor_map: Arc<TensorMap>) -> Self {
        ModelLoader { container, tensor_map, staging: Vec::new(), layer_loads: 0, layer_bytes_read: 0 }
    }

    /// Maximum single-layer byte span across all layers, plus per-tensor
    /// alignment padding -- the capacity the prefetcher sizes its pool
    /// buffers to.
    pub fn max_layer_size(&self) -> u64 {
        self.tensor_map.max_layer_size() + (N_LAYER_TENSORS * TENSOR_ALIGNMENT) as u64
    }

    /// Reads layer `layer_id`'s nine tensors with a single contiguous
    /// `read_span` call, then copies each tensor into `dst` at a
    /// 32-byte-aligned cursor, recording a `LayerView` describing the
    /// layout it chose.
    pub fn load_layer(&mut self, layer_id: u32, dst: &mut LayerBuffer) -> Result<()> {
        let spec = self
            .tensor_map
            .layers
            .get(layer_id as usize)
            .ok_or_else(|| EngineError::format(format!("layer {layer_id} out of range")))?;
        let (span_start, span_end) = spec.span();
        let span_size = (span_end - span_start) as usize;

        if self.staging.len() < span_size {
            let grown = (self.staging.len() * 2).max(span_size);
            self.staging.resize(grown, 0);
        }
        self.container.read_span_into(span_start, span_size as u64, &mut self.staging[..span_size])?;

        let refs = spec.refs();
        let mut slots = Vec::with_capacity(N_LAYER_TENSORS);
        let mut cursor = 0usize;
        for r in refs {
            cursor = align_up(cursor, TENSOR_ALIGNMENT);
            let size = r.size as usize;
            if cursor + size > dst.capacity {
                return Err(EngineError::BufferTooSmall { needed: cursor + size, have: dst.capacity });
            }
            let src_off = (r.offset - span_start) as usize;
            dst.data[cursor..cursor + size].copy_from_slice(&self.staging[src_off..src_off + size]);
            slots.push(TensorSlot { offset: cursor, size, dtype: r.dtype });
            cursor += size;
        }

        let slots: [TensorSlot; N_LAYER_TENSORS] = slots.try_into().unwrap_or_else(|_| unreachable!());
        dst.used = cursor;
        dst.view = Some(LayerView::new(layer_id, slots));

        self.layer_loads += 1;
        self.layer_bytes_read += span_size as u64;
        Ok(())
    }
}
