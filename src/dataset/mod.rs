//! Dataset module for super-resolution patch pipelines
//!
//! This module provides:
//! - Image decoding, bicubic resampling and HR -> LR degradation
//! - Patch slicing on a stride grid and merging back into whole images
//! - A memory-mapped on-disk store of (input, target) patch pairs
//! - Burn `Dataset`/`Batcher` implementations and a per-epoch batch stream
//!
//! ## Layout
//!
//! An [`SrDataset`] points at a directory of HR images. `save()` slices every
//! image into label patches of `lr_size * scale` pixels, degrades each one
//! into its network input, and writes both to `<image_dir>/.patches`.

pub mod burn_dataset;
pub mod image_ops;
pub mod patches;
pub mod sr_dataset;
pub mod store;

// Re-export main types for convenience
pub use burn_dataset::{PatchFlow, PatchItem, PatchStoreDataset, SrBatch, SrBatcher};
pub use image_ops::{degrade, downsample, interpolate, SrImage};
pub use patches::{merge_to_whole, slice_patches, MergeGrid, SliceMode};
pub use sr_dataset::{is_image_file, DatasetConfig, PatchPairs, SrDataset};
pub use store::{store_exists, PatchStore, PatchStoreWriter, StoreManifest};
