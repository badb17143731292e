//! Compute operators over plain `f32` activations and k-quantized weight
//! tensors. Every operator takes an `OpContext` first, even the ones that
//! don't yet use it, keeping room for a future multi-threaded or
//! GPU-backed operator backend without changing call sites.

pub mod attention;
pub mod embed;
pub mod matmul;
pub mod rmsnorm;
pub mod rope;
pub mod softmax;
pub mod swiglu;

pub use attention::attention;
pub use embed::embed;
pub use matmul::{matmul_f32, matmul_q8_0, matmul_qk};
pub use rmsnorm::rmsnorm;
pub use rope::rope;
pub use softmax::softmax;
pub use swiglu::mlp_swiglu;

/// Every operator here runs single-threaded regardless of `n_threads` --
/// serial execution is a correct reference implementation. The field
/// exists so a later multi-threaded or GPU backend can be swapped in
/// without changing call sites.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    pub n_threads: u32,
}

impl Default for OpContext {
    fn default() -> Self {
        OpContext { n_threads: 1 }
    }
}
