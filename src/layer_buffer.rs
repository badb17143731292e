//! The pooled buffer type the prefetcher hands between the worker thread
//! and the compute thread, plus the borrowed view the compute thread
//! reads a layer's nine tensors through while the buffer is `IN_USE`.

use crate::container::GgmlType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Loading,
    Ready,
    InUse,
    Error,
}

/// Canonical per-layer tensor order, matching `LayerSpec::refs()`.
pub const N_LAYER_TENSORS: usize = 9;
pub const ATTN_NORM: usize = 0;
pub const ATTN_Q: usize = 1;
pub const ATTN_K: usize = 2;
pub const ATTN_V: usize = 3;
pub const ATTN_O: usize = 4;
pub const FFN_NORM: usize = 5;
pub const FFN_GATE: usize = 6;
pub const FFN_UP: usize = 7;
pub const FFN_DOWN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct TensorSlot {
    pub offset: usize,
    pub size: usize,
    pub dtype: GgmlType,
}

/// Byte-range pointers (as offsets into the owning `LayerBuffer::data`)
/// for the nine tensors of one transformer block, valid only while that
/// buffer is `READY`/`IN_USE`.
#[derive(Debug, Clone, Copy)]
pub struct LayerView {
    pub layer_id: u32,
    slots: [TensorSlot; N_LAYER_TENSORS],
}

impl LayerView {
    pub fn new(layer_id: u32, slots: [TensorSlot; N_LAYER_TENSORS]) -> Self {
        LayerView { layer_id, slots }
    }

    fn slice<'a>(&self, idx: usize, data: &'a [u8]) -> &'a [u8] {
        let s = &self.slots[idx];
        &data[s.offset..s.offset + s.size]
    }

    pub fn dtype(&self, idx: usize) -> GgmlType {
        self.slots[idx].dtype
    }

    pub fn attn_norm<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(ATTN_NORM, data)
    }
    pub fn attn_q<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(ATTN_Q, data)
    }
    pub fn attn_k<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(ATTN_K, data)
    }
    pub fn attn_v<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(ATTN_V, data)
    }
    pub fn attn_o<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(ATTN_O, data)
    }
    pub fn ffn_norm<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(FFN_NORM, data)
    }
    pub fn ffn_gate<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(FFN_GATE, data)
    }
    pub fn ffn_up<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(FFN_UP, data)
    }
    pub fn ffn_down<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        self.slice(FFN_DOWN, data)
    }
}

/// One slot in the prefetcher's ring. `data`/`view` are meaningful only
/// in `READY`/`IN_USE` states; the worker writes them while `LOADING`,
/// the compute thread reads them while `IN_USE`.
pub struct LayerBuffer {
    pub state: BufferState,
    pub layer_id: Option<u32>,
    pub data: Vec<u8>,
    pub capacity: usize,
    pub used: usize,
    pub view: Option<LayerView>,
}

impl LayerBuffer {
    pub fn new(capacity: usize) -> Self {
        LayerBuffer { state: BufferState::Empty, layer_id: None, data: vec![0u8; capacity], capacity, used: 0, view: None }
    }
}
