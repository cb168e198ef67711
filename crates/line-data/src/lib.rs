//! Handwriting line-image corpus handling.
//!
//! Indexes labeled line-image manifests, performs per-fetch preprocessing
//! (height normalization, augmentation, pixel remapping) and collates
//! variable-width samples into dense padded batches.

pub mod augment;
pub mod codec;
pub mod collate;
pub mod dataset;
pub mod error;
pub mod manifest;
pub mod normalize;
pub mod spaced;
pub mod style;

pub use codec::CharCodec;
pub use collate::{collate, AuthorGroup, Batch, Planar, PADDING_CONSTANT};
pub use dataset::{AugmentationMode, DatasetConfig, LineDataset, Sample, Split};
pub use error::DataError;
pub use normalize::LineImage;
pub use spaced::SpacedStore;
pub use style::StyleStore;
