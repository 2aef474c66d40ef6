//! Connectionist temporal classification loss
//!
//! The negative log-likelihood of each target is computed with the forward
//! algorithm over the blank-extended target `[b, l1, b, l2, ..., lL, b]`, in
//! log space and vectorized over the batch. Every operation is a candle tensor
//! operation so the loss backpropagates into the logits.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::log_softmax;
use tracing::debug;

use crate::error::{Error, Result};

/// Stand-in for log(0) that stays finite under addition
const NEG: f32 = -1e30;

/// Number of timesteps needed to align `target`: one per label plus one
/// separating blank between every pair of equal neighbours.
pub fn required_steps(target: &[u32]) -> usize {
    let repeats = target.windows(2).filter(|w| w[0] == w[1]).count();
    target.len() + repeats
}

/// Check that every target can be aligned against its sequence length and
/// holds only non-blank labels.
pub fn validate_targets(targets: &[Vec<u32>], lengths: &[usize], blank: u32) -> Result<()> {
    if targets.len() != lengths.len() {
        return Err(Error::shape_mismatch(format!(
            "{} targets for {} sequence lengths",
            targets.len(),
            lengths.len()
        )));
    }
    for (row, (target, &steps)) in targets.iter().zip(lengths).enumerate() {
        if let Some(&label) = target.iter().find(|&&label| label >= blank) {
            return Err(Error::invalid_target(format!(
                "Example {row}: label {label} is not below the blank index {blank}"
            )));
        }
        let needed = required_steps(target);
        if needed > steps {
            return Err(Error::invalid_target(format!(
                "Example {row}: a target of {} labels needs {needed} timesteps, only {steps} available",
                target.len()
            )));
        }
    }
    Ok(())
}

/// `log(exp(a) + exp(b) + exp(c))`, elementwise
fn log_sum_exp3(a: &Tensor, b: &Tensor, c: &Tensor) -> Result<Tensor> {
    let max = a.maximum(b)?.maximum(c)?.detach();
    let sum = ((a - &max)?.exp()? + (b - &max)?.exp()?)? + (c - &max)?.exp()?;
    Ok((sum?.log()? + max)?)
}

/// Shift `alpha` right by `k` states along dim 1, filling with [`NEG`].
fn shift_states(alpha: &Tensor, k: usize) -> Result<Tensor> {
    let (batch, states) = alpha.dims2()?;
    let fill = Tensor::full(NEG, (batch, k.min(states)), alpha.device())?;
    if k >= states {
        return Ok(fill);
    }
    Ok(Tensor::cat(&[&fill, &alpha.narrow(1, 0, states - k)?], 1)?)
}

struct ExtendedTargets {
    /// `[batch, states]` blank-extended labels, padded with the blank
    labels: Tensor,
    /// `[batch, states]` 0 where the skip transition `s-2 -> s` is allowed, NEG elsewhere
    skip: Tensor,
    /// `[batch, states]` 0 for the two admissible start states, NEG elsewhere
    start: Tensor,
    /// `[batch, 2]` indices of the two admissible final states
    finals: Tensor,
    /// `[batch, 2]` 0 where the final state exists, NEG elsewhere
    finals_mask: Tensor,
}

impl ExtendedTargets {
    fn new(targets: &[Vec<u32>], blank: u32, device: &Device) -> Result<Self> {
        let batch = targets.len();
        let max_len = targets.iter().map(Vec::len).max().unwrap_or(0);
        let states = 2 * max_len + 1;

        let mut labels = vec![blank; batch * states];
        let mut skip = vec![NEG; batch * states];
        let mut start = vec![NEG; batch * states];
        let mut finals = vec![0u32; batch * 2];
        let mut finals_mask = vec![NEG; batch * 2];

        for (row, target) in targets.iter().enumerate() {
            let offset = row * states;
            let extended = 2 * target.len() + 1;
            for (i, &label) in target.iter().enumerate() {
                let s = 2 * i + 1;
                labels[offset + s] = label;
                if i > 0 && target[i - 1] != label {
                    skip[offset + s] = 0.0;
                }
            }

            start[offset] = 0.0;
            if extended > 1 {
                start[offset + 1] = 0.0;
            }

            finals[row * 2] = (extended - 1) as u32;
            finals_mask[row * 2] = 0.0;
            if extended > 1 {
                finals[row * 2 + 1] = (extended - 2) as u32;
                finals_mask[row * 2 + 1] = 0.0;
            }
        }

        Ok(Self {
            labels: Tensor::from_vec(labels, (batch, states), device)?,
            skip: Tensor::from_vec(skip, (batch, states), device)?,
            start: Tensor::from_vec(start, (batch, states), device)?,
            finals: Tensor::from_vec(finals, (batch, 2), device)?,
            finals_mask: Tensor::from_vec(finals_mask, (batch, 2), device)?,
        })
    }
}

/// Per-example CTC negative log-likelihood.
///
/// `logits` is time-major `[steps, batch, classes]`, `lengths[b]` the number
/// of valid timesteps of example `b`. Returns `[batch]`.
pub fn ctc_nll(
    logits: &Tensor,
    targets: &[Vec<u32>],
    lengths: &[usize],
    blank: u32,
) -> Result<Tensor> {
    let (steps, batch, classes) = logits.dims3()?;
    if targets.len() != batch {
        return Err(Error::shape_mismatch(format!(
            "{} targets for a batch of {batch}",
            targets.len()
        )));
    }
    if blank as usize >= classes {
        return Err(Error::shape_mismatch(format!(
            "Blank index {blank} does not fit {classes} classes"
        )));
    }
    if let Some(&len) = lengths.iter().find(|&&len| len == 0 || len > steps) {
        return Err(Error::shape_mismatch(format!(
            "Sequence length {len} is outside 1..={steps}"
        )));
    }
    validate_targets(targets, lengths, blank)?;

    let device = logits.device();
    let ext = ExtendedTargets::new(targets, blank, device)?;
    let (_, states) = ext.labels.dims2()?;

    // [B, T, C] -> per-state emission log-probabilities [B, T, S]
    let log_probs = log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?
        .transpose(0, 1)?
        .contiguous()?;
    let index = ext
        .labels
        .unsqueeze(1)?
        .broadcast_as((batch, steps, states))?
        .contiguous()?;
    let emissions = log_probs.gather(&index, 2)?;

    let ragged = lengths.iter().any(|&len| len != steps);

    let mut alpha = (emissions.narrow(1, 0, 1)?.squeeze(1)? + &ext.start)?;
    for t in 1..steps {
        let emit = emissions.narrow(1, t, 1)?.squeeze(1)?;
        let stay = &alpha;
        let advance = shift_states(&alpha, 1)?;
        let skip = (shift_states(&alpha, 2)? + &ext.skip)?;
        let next = (log_sum_exp3(stay, &advance, &skip)? + emit)?;

        alpha = if ragged {
            let active: Vec<u8> = lengths.iter().map(|&len| u8::from(t < len)).collect();
            let active = Tensor::from_vec(active, (batch, 1), device)?
                .broadcast_as((batch, states))?
                .contiguous()?;
            active.where_cond(&next, &alpha)?
        } else {
            next
        };
    }

    let ends = (alpha.gather(&ext.finals, 1)? + &ext.finals_mask)?;
    let max = ends.max_keepdim(1)?.detach();
    let log_likelihood = (ends.broadcast_sub(&max)?.exp()?.sum_keepdim(1)?.log()? + max)?;
    let nll = log_likelihood.squeeze(1)?.neg()?;

    debug!("CTC over {} steps, {} extended states", steps, states);
    Ok(nll)
}

/// Mean CTC negative log-likelihood over the batch, a scalar tensor.
pub fn ctc_loss(
    logits: &Tensor,
    targets: &[Vec<u32>],
    lengths: &[usize],
    blank: u32,
) -> Result<Tensor> {
    Ok(ctc_nll(logits, targets, lengths, blank)?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn logits_from(values: Vec<f32>, steps: usize, classes: usize) -> Tensor {
        Tensor::from_vec(values, (steps, 1, classes), &Device::Cpu).unwrap()
    }

    fn nll(logits: &Tensor, target: Vec<u32>, blank: u32) -> f32 {
        let (steps, _, _) = logits.dims3().unwrap();
        ctc_nll(logits, &[target], &[steps], blank)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0]
    }

    #[test]
    fn test_uniform_scores_count_alignments() {
        // 2 classes (label 0, blank 1), 2 steps, uniform probabilities 1/2.
        // Target [0]: alignments 0b, b0, 00 -> p = 3/4.
        let logits = logits_from(vec![0.0; 4], 2, 2);
        assert_relative_eq!(nll(&logits, vec![0], 1), -(0.75f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_empty_target_is_all_blanks() {
        // p(blank) = 1/3 per step over 3 steps.
        let logits = logits_from(vec![0.0; 9], 3, 3);
        assert_relative_eq!(nll(&logits, vec![], 2), 3.0 * 3f32.ln(), epsilon = 1e-4);
    }

    #[test]
    fn test_repeated_labels_need_separating_blank() {
        // Target [0, 0] over exactly 3 steps has the single path 0 b 0.
        let logits = logits_from(vec![0.0; 6], 3, 2);
        assert_relative_eq!(nll(&logits, vec![0, 0], 1), 3.0 * 2f32.ln(), epsilon = 1e-4);
    }

    #[test]
    fn test_confident_correct_path_has_low_loss() {
        let mut values = vec![-10.0f32; 3 * 3];
        // steps: label 0, blank, label 1
        values[0] = 10.0;
        values[3 + 2] = 10.0;
        values[6 + 1] = 10.0;
        let logits = logits_from(values, 3, 3);
        assert!(nll(&logits, vec![0, 1], 2) < 1e-3);
        assert!(nll(&logits, vec![1, 0], 2) > 10.0);
    }

    #[test]
    fn test_shorter_lengths_ignore_trailing_steps() {
        let device = Device::Cpu;
        let mut values = vec![0.0f32; 4 * 2 * 2];
        // Example 1 gets garbage after its two valid steps.
        for t in 2..4 {
            values[(t * 2 + 1) * 2] = 50.0;
        }
        let logits = Tensor::from_vec(values, (4, 2, 2), &device).unwrap();
        let out = ctc_nll(&logits, &[vec![0], vec![0]], &[2, 2], 1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_relative_eq!(out[0], out[1], epsilon = 1e-5);
        assert_relative_eq!(out[0], -(0.75f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_infeasible_target_is_rejected() {
        let logits = logits_from(vec![0.0; 4], 2, 2);
        let err = ctc_nll(&logits, &[vec![0, 0]], &[2], 1).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    #[test]
    fn test_blank_label_is_rejected() {
        let logits = logits_from(vec![0.0; 6], 2, 3);
        let err = ctc_nll(&logits, &[vec![2]], &[2], 2).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    #[test]
    fn test_required_steps() {
        assert_eq!(required_steps(&[]), 0);
        assert_eq!(required_steps(&[1, 2, 3]), 3);
        assert_eq!(required_steps(&[1, 1, 2, 2]), 6);
    }

    #[test]
    fn test_loss_is_differentiable() {
        let var = candle_core::Var::zeros((3, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let loss = ctc_loss(var.as_tensor(), &[vec![0, 1], vec![2]], &[3, 3], 3).unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap();
        let magnitude = grad.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(magnitude > 0.0);
        assert!(magnitude.is_finite());
    }
}
