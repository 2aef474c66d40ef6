//! Test suite for CRNN training infrastructure
//!
//! Covers the training loop, checkpoint persistence and restore, and an
//! end-to-end run from image files to transcripts.

// Test modules
pub mod checkpoint_tests;

// Utility modules for testing
pub mod fixtures;

pub use fixtures::{
    banded_batch, model_config, tiny_model, training_config, TrainingTestFixture, ALPHABET,
    IMAGE_WIDTH,
};
