//! Alignment-free sequence loss, decoding and quality metrics

pub mod decoder;
pub mod loss;
pub mod metrics;

pub use decoder::{collapse_alignment, decode, DecodedBatch, PAD_VALUE};
pub use loss::{ctc_loss, ctc_nll, required_steps, validate_targets};
pub use metrics::{levenshtein, mean_edit_distance, normalized_edit_distance};
