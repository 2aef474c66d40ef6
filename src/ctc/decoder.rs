//! CTC decoding
//!
//! Turns time-major logits into label sequences. The prefix beam search keeps
//! the most probable label prefixes, summing every alignment that collapses to
//! the same prefix. A symbol only appears twice in a row in the output when the
//! alignment separated the two occurrences with a blank; no repeat merging is
//! applied after the search.

use std::cmp::Ordering;
use std::collections::HashMap;

use candle_core::{Tensor, D};
use candle_nn::ops::log_softmax;

use crate::config::DecoderKind;
use crate::error::{Error, Result};

/// Value used to right-pad decoded sequences
pub const PAD_VALUE: i64 = -1;

/// Decoded hypotheses of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    sequences: Vec<Vec<u32>>,
}

impl DecodedBatch {
    /// Wrap one hypothesis per example
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self { sequences }
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether the batch holds no example
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Length of the longest hypothesis
    pub fn max_len(&self) -> usize {
        self.sequences.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Unpadded hypotheses
    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    /// Hypotheses right-padded with [`PAD_VALUE`] to the longest one
    pub fn dense(&self) -> Vec<Vec<i64>> {
        let width = self.max_len();
        self.sequences
            .iter()
            .map(|seq| {
                let mut row: Vec<i64> = seq.iter().map(|&c| i64::from(c)).collect();
                row.resize(width, PAD_VALUE);
                row
            })
            .collect()
    }
}

/// Apply the CTC alignment rule: merge runs of equal symbols, then drop blanks.
pub fn collapse_alignment(path: &[u32], blank: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(path.len());
    let mut previous = None;
    for &symbol in path {
        if Some(symbol) != previous && symbol != blank {
            out.push(symbol);
        }
        previous = Some(symbol);
    }
    out
}

fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Log-probabilities of a prefix ending in a blank and in a non-blank
#[derive(Debug, Clone, Copy)]
struct PrefixScore {
    blank: f32,
    non_blank: f32,
}

impl PrefixScore {
    const ZERO: Self = Self {
        blank: f32::NEG_INFINITY,
        non_blank: f32::NEG_INFINITY,
    };

    fn total(&self) -> f32 {
        log_add(self.blank, self.non_blank)
    }
}

/// Prefix beam search over one example's `[steps, classes]` log-probabilities.
pub fn beam_search(log_probs: &[Vec<f32>], blank: u32, width: usize) -> Vec<u32> {
    let mut beams: Vec<(Vec<u32>, PrefixScore)> = vec![(
        Vec::new(),
        PrefixScore {
            blank: 0.0,
            non_blank: f32::NEG_INFINITY,
        },
    )];

    for frame in log_probs {
        let mut next: HashMap<Vec<u32>, PrefixScore> = HashMap::new();

        for (prefix, score) in &beams {
            let total = score.total();
            let last = prefix.last().copied();

            let entry = next.entry(prefix.clone()).or_insert(PrefixScore::ZERO);
            entry.blank = log_add(entry.blank, total + frame[blank as usize]);

            for (class, &p) in frame.iter().enumerate() {
                let class = class as u32;
                if class == blank {
                    continue;
                }

                let mut extended = prefix.clone();
                extended.push(class);
                if last == Some(class) {
                    // Staying in the run keeps the prefix; a new occurrence needs a blank first.
                    let same = next.entry(prefix.clone()).or_insert(PrefixScore::ZERO);
                    same.non_blank = log_add(same.non_blank, score.non_blank + p);
                    let entry = next.entry(extended).or_insert(PrefixScore::ZERO);
                    entry.non_blank = log_add(entry.non_blank, score.blank + p);
                } else {
                    let entry = next.entry(extended).or_insert(PrefixScore::ZERO);
                    entry.non_blank = log_add(entry.non_blank, total + p);
                }
            }
        }

        let mut ranked: Vec<(Vec<u32>, PrefixScore)> = next.into_iter().collect();
        ranked.sort_by(|(pa, a), (pb, b)| {
            b.total()
                .partial_cmp(&a.total())
                .unwrap_or(Ordering::Equal)
                .then_with(|| pa.cmp(pb))
        });
        ranked.truncate(width.max(1));
        beams = ranked;
    }

    beams
        .into_iter()
        .next()
        .map(|(prefix, _)| prefix)
        .unwrap_or_default()
}

/// Best path decoding: arg-max per step, then the alignment rule.
pub fn greedy_search(log_probs: &[Vec<f32>], blank: u32) -> Vec<u32> {
    let path: Vec<u32> = log_probs
        .iter()
        .map(|frame| {
            frame
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .map(|(class, _)| class as u32)
                .unwrap_or(blank)
        })
        .collect();
    collapse_alignment(&path, blank)
}

/// Decode time-major `[steps, batch, classes]` logits, honouring each
/// example's valid length.
pub fn decode(
    logits: &Tensor,
    lengths: &[usize],
    blank: u32,
    kind: DecoderKind,
) -> Result<DecodedBatch> {
    let (steps, batch, classes) = logits.dims3()?;
    if lengths.len() != batch {
        return Err(Error::shape_mismatch(format!(
            "{} sequence lengths for a batch of {batch}",
            lengths.len()
        )));
    }
    if blank as usize >= classes {
        return Err(Error::shape_mismatch(format!(
            "Blank index {blank} does not fit {classes} classes"
        )));
    }

    let log_probs = log_softmax(logits, D::Minus1)?
        .transpose(0, 1)?
        .to_vec3::<f32>()?;

    let sequences = log_probs
        .iter()
        .zip(lengths)
        .map(|(frames, &len)| {
            let frames = &frames[..len.min(steps)];
            match kind {
                DecoderKind::BeamSearch { width } => beam_search(frames, blank, width),
                DecoderKind::Greedy => greedy_search(frames, blank),
            }
        })
        .collect();

    Ok(DecodedBatch::new(sequences))
}
