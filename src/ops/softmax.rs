//! Numerically stable softmax with a dedicated `NumericError` when the
//! normalizer is zero -- that only happens for a row that is entirely
//! `-inf` (fully masked), which is a generation-fatal condition rather
//! than a precondition violation.

use crate::error::{EngineError, Result};

pub fn softmax(input: &[f32], output: &mut [f32]) -> Result<()> {
    if input.len() != output.len() {
        return Err(EngineError::precondition("softmax: input/output length mismatch"));
    }
    if input.is_empty() {
        return Err(EngineError::precondition("softmax: empty input"));
    }

    let max = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum_exp = 0.0f32;
    for i in 0..input.len() {
        let e = (input[i] - max).exp();
        output[i] = e;
        sum_exp += e;
    }
    if sum_exp == 0.0 {
        return Err(EngineError::Numeric("softmax: zero-sum row".into()));
    }
    for v in output.iter_mut() {
        *v /= sum_exp;
    }
    Ok(())
}
