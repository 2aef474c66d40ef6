//! Example loading, label encoding and batching

pub mod codec;
pub mod manager;
pub mod preprocessing;
pub mod sparse;

pub use codec::LabelCodec;
pub use manager::{Batch, BatchSource, DataManager, DataManagerConfig};
pub use preprocessing::{load_image, preprocess};
pub use sparse::SparseTarget;
