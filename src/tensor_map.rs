//! Classifies a container's tensor descriptors into the resident set
//! (token embedding, final norm, LM head) and the per-layer streaming set
//! (the nine weight tensors of a transformer block), by parsing GGUF's
//! `blk.<N>.<field>` naming convention.

use crate::container::{GgmlType, GgufContainer};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct TensorRef {
    pub offset: u64,
    pub size: u64,
    pub dtype: GgmlType,
    pub dims: Vec<u64>,
}

impl TensorRef {
    fn from_descriptor(t: &crate::container::TensorDescriptor) -> Self {
        TensorRef { offset: t.offset, size: t.size, dtype: t.dtype, dims: t.dims.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct ResidentSpec {
    pub token_embd: TensorRef,
    pub output_norm: TensorRef,
    pub lm_head: TensorRef,
}

#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub attn_norm: TensorRef,
    pub attn_q: TensorRef,
    pub attn_k: TensorRef,
    pub attn_v: TensorRef,
    pub attn_o: TensorRef,
    pub ffn_norm: TensorRef,
    pub ffn_gate: TensorRef,
    pub ffn_up: TensorRef,
    pub ffn_down: TensorRef,
}

impl LayerSpec {
    /// The nine per-layer tensors in canonical load order.
    pub fn refs(&self) -> [&TensorRef; 9] {
        [
            &self.attn_norm,
            &self.attn_q,
            &self.attn_k,
            &self.attn_v,
            &self.attn_o,
            &self.ffn_norm,
            &self.ffn_gate,
            &self.ffn_up,
            &self.ffn_down,
        ]
    }

    /// `[span_start, span_end)` covering all nine tensors contiguously in
    /// the source file, for the single `read_span` call per layer load.
    pub fn span(&self) -> (u64, u64) {
        let refs = self.refs();
        let start = refs.iter().map(|r| r.offset).min().unwrap();
        let end = refs.iter().map(|r| r.offset + r.size).max().unwrap();
        (start, end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LlamaField {
    AttnNorm,
    AttnQ,
    AttnK,
    AttnV,
    AttnO,
    FfnNorm,
    FfnGate,
    FfnUp,
    FfnDown,
}

const REQUIRED_FIELDS: [LlamaField; 9] = [
    LlamaField::AttnNorm,
    LlamaField::AttnQ,
    LlamaField::AttnK,
    LlamaField::AttnV,
    LlamaField::AttnO,
    LlamaField::FfnNorm,
    LlamaField::FfnGate,
    LlamaField::FfnUp,
    LlamaField::FfnDown,
];

fn parse_layer_id(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("blk.")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let after = &rest[digits.len()..];
    if !after.starts_with('.') {
        return None;
    }
    digits.parse().ok()
}

fn field_suffix(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("blk.")?;
    let digits_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let after = &rest[digits_len..];
    after.strip_prefix('.')
}

fn map_field(name: &str) -> Option<LlamaField> {
    match field_suffix(name)? {
        "attn_norm.weight" => Some(LlamaField::AttnNorm),
        "attn_q.weight" => Some(LlamaField::AttnQ),
        "attn_k.weight" => Some(LlamaField::AttnK),
        "attn_v.weight" => Some(LlamaField::AttnV),
        "attn_output.weight" => Some(LlamaField::AttnO),
        "ffn_norm.weight" => Some(LlamaField::FfnNorm),
        "ffn_gate.weight" => Some(LlamaField::FfnGate),
        "ffn_up.weight" => Some(LlamaField::FfnUp),
        "ffn_down.weight" => Some(LlamaField::FfnDown),
        _ => None,
    }
}

pub struct TensorMap {
    pub resident: ResidentSpec,
    pub layers: Vec<LayerSpec>,
}

struct PartialLayer {
    attn_norm: Option<TensorRef>,
    attn_q: Option<TensorRef>,
    attn_k: Option<TensorRef>,
    attn_v: Option<TensorRef>,
    attn_o: Option<TensorRef>,
    ffn_norm: Option<TensorRef>,
    ffn_gate: Option<TensorRef>,
    ffn_up: Option<TensorRef>,
    ffn_down: Option<TensorRef>,
}

impl PartialLayer {
    fn empty() -> Self {
        PartialLayer {
            attn_norm: None,
            attn_q: None,
            attn_k: None,
            attn_v: None,
            attn_o: None,
            ffn_norm: None,
            ffn_gate: None,
            ffn_up: None,
            ffn_down: None,
        }
    }

    fn set(&mut self, field: LlamaField, r: TensorRef) {
        match field {
            LlamaField::AttnNorm => self.attn_norm = Some(r),
            LlamaField::AttnQ => self.attn_q = Some(r),
            LlamaField::AttnK => self.attn_k = Some(r),
            LlamaField::AttnV => self.attn_v = Some(r),
            LlamaField::AttnO => self.attn_o = Some(r),
            LlamaField::FfnNorm => self.ffn_norm = Some(r),
            LlamaField::FfnGate => self.ffn_gate = Some(r),
            LlamaField::FfnUp => self.ffn_up = Some(r),
            LlamaField::FfnDown => self.ffn_down = Some(r),
        }
    }

    fn has(&self, field: LlamaField) -> bool {
        match field {
            LlamaField::AttnNorm => self.attn_norm.is_some(),
            LlamaField::AttnQ => self.attn_q.is_some(),
            LlamaField::AttnK => self.attn_k.is_some(),
            LlamaField::AttnV => self.attn_v.is_some(),
            LlamaField::AttnO => self.attn_o.is_some(),
            LlamaField::FfnNorm => self.ffn_norm.is_some(),
            LlamaField::FfnGate => self.ffn_gate.is_some(),
            LlamaField::FfnUp => self.ffn_up.is_some(),
            LlamaField::FfnDown => self.ffn_down.is_some(),
        }
    }

    fn into_layer_spec(self) -> Option<LayerSpec> {
        Some(LayerSpec {
            attn_norm: self.attn_norm?,
            attn_q: self.attn_q?,
            attn_k: self.attn_k?,
            attn_v: self.attn_v?,
            attn_o: self.attn_o?,
            ffn_norm: self.ffn_norm?,
            ffn_gate: self.ffn_gate?,
            ffn_up: self.ffn_up?,
            ffn_down: self.ffn_down?,
        })
    }
}

impl TensorMap {
    pub fn build(container: &GgufContainer) -> Result<Self> {
        let n_layers = container
            .get_u32("llama.block_count")
            .ok_or_else(|| EngineError::format("missing llama.block_count"))?;
        if n_layers == 0 {
            return Err(EngineError::format("llama.block_count is zero"));
        }

        let mut partials: Vec<PartialLayer> = (0..n_layers).map(|_| PartialLayer::empty()).collect();

        for t in &container.tensors {
            let Some(layer_id) = parse_layer_id(&t.name) else { continue };
            if layer_id >= n_layers {
                continue;
            }
            let Some(field) = map_field(&t.name) else { continue };
            partials[layer_id as usize].set(field, TensorRef::from_descriptor(t));
        }

        for (i, p) in partials.iter().enumerate() {
            for field in REQUIRED_FIELDS {
                if !p.has(field) {
                    return Err(EngineError::format(format!(
                        "layer {i} missing required tensor field {field:?}"
                    )));
                }
            }
        }

        let layers = partials
            .into_iter()
            .map(|p| p.into_layer_spec().expect("validated above"))
            .collect();

        let token_embd = container
            .find_tensor("token_embd.weight")
            .map(TensorRef::from_descriptor)
            .ok_or_else(|| EngineError::format("missing token_embd.weight"))?;
        let output_norm = container
            .find_tensor("output_norm.weight")
            .map(TensorRef::from_descriptor)
            .ok_or_else(|| EngineError::format("missing output_norm.weight"))?;
        let lm_head = container
            .find_tensor("output.weight")
            .map(TensorRef::from_descriptor)
            .ok_or_else(|| EngineError::format("missing output.weight"))?;

        Ok(TensorMap { resident: ResidentSpec { token_embd, output_norm, lm_head }, layers })
    }

    pub fn max_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.refs().iter().map(|r| r.size).sum::<u64>()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layer_id_and_field() {
        assert_eq!(parse_layer_id("blk.7.attn_q.weight"), Some(7));
        assert_eq!(parse_layer_id("blk.12.ffn_down.weight"), Some(12));
        assert_eq!(parse_layer_id("token_embd.weight"), None);
        assert_eq!(map_field("blk.0.attn_output.weight"), Some(LlamaField::AttnO));
        assert_eq!(map_field("blk.3.ffn_gate.weight"), Some(LlamaField::FfnGate));
        assert_eq!(map_field("blk.3.unknown.weight"), None);
    }
}
