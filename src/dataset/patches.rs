//! Patch slicing and merging
//!
//! `Normal` slicing walks a regular grid of complete windows so the outputs
//! can be stitched back with [`merge_to_whole`]. `Random` slicing draws
//! seeded crops for training and carries no merge information.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::image_ops::SrImage;
use crate::utils::error::{Result, SrError};

/// How an image is cut into patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceMode {
    /// Complete windows on the stride grid, row-major
    Normal,
    /// `per_image` random windows drawn from a seeded RNG
    Random { per_image: usize, seed: u64 },
}

impl Default for SliceMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl SliceMode {
    /// Mode used for one named image
    ///
    /// Random seeds are mixed with the image name so each image gets its own
    /// windows while the whole slicing stays reproducible.
    pub fn for_image(self, image_name: &str) -> Self {
        match self {
            SliceMode::Normal => SliceMode::Normal,
            SliceMode::Random { per_image, seed } => SliceMode::Random {
                per_image,
                seed: seed ^ name_hash(image_name),
            },
        }
    }
}

/// FNV-1a, stable across platforms and releases
fn name_hash(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl fmt::Display for SliceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceMode::Normal => write!(f, "normal"),
            SliceMode::Random { .. } => write!(f, "random"),
        }
    }
}

/// Layout of a normal slicing, needed to merge patches back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeGrid {
    pub rows: usize,
    pub cols: usize,
    pub patch: usize,
    pub stride: usize,
}

impl MergeGrid {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Height and width of the merged image
    pub fn merged_size(&self) -> (usize, usize) {
        (
            (self.rows - 1) * self.stride + self.patch,
            (self.cols - 1) * self.stride + self.patch,
        )
    }

    /// Same layout expressed for patches `factor` times larger
    pub fn scaled(&self, factor: usize) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            patch: self.patch * factor,
            stride: self.stride * factor,
        }
    }
}

/// Top-left corners of every window along one axis
fn grid_positions(length: usize, patch: usize, stride: usize) -> Vec<usize> {
    if length < patch {
        return Vec::new();
    }
    (0..=length - patch).step_by(stride).collect()
}

/// Cut an image into square patches
///
/// The returned grid is `Some` only for [`SliceMode::Normal`].
pub fn slice_patches(
    img: &SrImage,
    patch: usize,
    stride: usize,
    mode: SliceMode,
) -> Result<(Vec<SrImage>, Option<MergeGrid>)> {
    if patch == 0 || stride == 0 {
        return Err(SrError::Config(
            "patch size and stride must be positive".to_string(),
        ));
    }
    if img.height < patch || img.width < patch {
        return Err(SrError::Dataset(format!(
            "Image of {}x{} is smaller than the {}px patch",
            img.width, img.height, patch
        )));
    }

    match mode {
        SliceMode::Normal => {
            let ys = grid_positions(img.height, patch, stride);
            let xs = grid_positions(img.width, patch, stride);

            let mut patches = Vec::with_capacity(ys.len() * xs.len());
            for &y in &ys {
                for &x in &xs {
                    patches.push(img.crop(y, x, patch));
                }
            }

            let grid = MergeGrid {
                rows: ys.len(),
                cols: xs.len(),
                patch,
                stride,
            };
            Ok((patches, Some(grid)))
        }
        SliceMode::Random { per_image, seed } => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let patches = (0..per_image)
                .map(|_| {
                    let y = rng.gen_range(0..=img.height - patch);
                    let x = rng.gen_range(0..=img.width - patch);
                    img.crop(y, x, patch)
                })
                .collect();
            Ok((patches, None))
        }
    }
}

/// Rebuild a whole image from row-major grid patches
///
/// Overlapping pixels are averaged.
pub fn merge_to_whole(patches: &[SrImage], grid: &MergeGrid) -> Result<SrImage> {
    if patches.len() != grid.len() || grid.is_empty() {
        return Err(SrError::Dataset(format!(
            "Expected {} patches for a {}x{} grid, got {}",
            grid.len(),
            grid.rows,
            grid.cols,
            patches.len()
        )));
    }

    let channels = patches[0].channels;
    if let Some(bad) = patches
        .iter()
        .find(|p| p.height != grid.patch || p.width != grid.patch || p.channels != channels)
    {
        return Err(SrError::Dataset(format!(
            "Patch of {}x{}x{} does not match grid patch size {}",
            bad.channels, bad.height, bad.width, grid.patch
        )));
    }

    let (height, width) = grid.merged_size();
    let mut sum = vec![0.0f32; channels * height * width];
    let mut weight = vec![0u32; height * width];

    for (idx, p) in patches.iter().enumerate() {
        let top = (idx / grid.cols) * grid.stride;
        let left = (idx % grid.cols) * grid.stride;

        for y in 0..grid.patch {
            for x in 0..grid.patch {
                weight[(top + y) * width + left + x] += 1;
            }
        }
        for c in 0..channels {
            let src_plane = c * grid.patch * grid.patch;
            let dst_plane = c * height * width;
            for y in 0..grid.patch {
                let src = src_plane + y * grid.patch;
                let dst = dst_plane + (top + y) * width + left;
                for x in 0..grid.patch {
                    sum[dst + x] += p.data[src + x];
                }
            }
        }
    }

    let plane = height * width;
    for (i, value) in sum.iter_mut().enumerate() {
        let w = weight[i % plane];
        if w > 0 {
            *value /= w as f32;
        }
    }

    SrImage::new(channels, height, width, sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(channels: usize, height: usize, width: usize) -> SrImage {
        let data = (0..channels * height * width)
            .map(|i| ((i * 37) % 97) as f32 / 96.0)
            .collect();
        SrImage::new(channels, height, width, data).unwrap()
    }

    #[test]
    fn test_normal_slicing_grid() {
        let img = test_image(3, 20, 28);
        let (patches, grid) = slice_patches(&img, 8, 4, SliceMode::Normal).unwrap();
        let grid = grid.unwrap();

        assert_eq!(grid.rows, 4); // 0, 4, 8, 12
        assert_eq!(grid.cols, 6); // 0, 4, ..., 20
        assert_eq!(patches.len(), 24);
        assert!(patches.iter().all(|p| p.height == 8 && p.width == 8));
    }

    #[test]
    fn test_slice_then_merge_is_exact() {
        let img = test_image(3, 24, 32);
        let (patches, grid) = slice_patches(&img, 8, 4, SliceMode::Normal).unwrap();
        let merged = merge_to_whole(&patches, &grid.unwrap()).unwrap();

        assert_eq!((merged.height, merged.width), (24, 32));
        for (a, b) in img.data.iter().zip(merged.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_non_overlapping_merge_is_exact() {
        let img = test_image(1, 16, 16);
        let (patches, grid) = slice_patches(&img, 4, 4, SliceMode::Normal).unwrap();
        let merged = merge_to_whole(&patches, &grid.unwrap()).unwrap();
        assert_eq!(merged, img);
    }

    #[test]
    fn test_merge_drops_uncovered_border() {
        // (18 - 8) is not a multiple of 4, so the last two rows are never covered
        let img = test_image(1, 18, 16);
        let (patches, grid) = slice_patches(&img, 8, 4, SliceMode::Normal).unwrap();
        let merged = merge_to_whole(&patches, &grid.unwrap()).unwrap();
        assert_eq!((merged.height, merged.width), (16, 16));
    }

    #[test]
    fn test_random_slicing_is_seeded() {
        let img = test_image(3, 32, 32);
        let mode = SliceMode::Random { per_image: 5, seed: 7 };
        let (a, grid) = slice_patches(&img, 8, 4, mode).unwrap();
        let (b, _) = slice_patches(&img, 8, 4, mode).unwrap();

        assert!(grid.is_none());
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_windows_differ_per_image() {
        let img = test_image(1, 32, 32);
        let mode = SliceMode::Random { per_image: 4, seed: 7 };

        let (a, _) = slice_patches(&img, 8, 4, mode.for_image("a.png")).unwrap();
        let (b, _) = slice_patches(&img, 8, 4, mode.for_image("b.png")).unwrap();
        let (a_again, _) = slice_patches(&img, 8, 4, mode.for_image("a.png")).unwrap();

        assert_ne!(a, b);
        assert_eq!(a, a_again);
        assert_eq!(SliceMode::Normal.for_image("a.png"), SliceMode::Normal);
    }

    #[test]
    fn test_patch_larger_than_image() {
        let img = test_image(1, 6, 6);
        assert!(slice_patches(&img, 8, 4, SliceMode::Normal).is_err());
        assert!(slice_patches(&img, 4, 0, SliceMode::Normal).is_err());
    }

    #[test]
    fn test_merge_rejects_wrong_count() {
        let grid = MergeGrid { rows: 2, cols: 2, patch: 4, stride: 4 };
        let patches = vec![SrImage::zeros(1, 4, 4); 3];
        assert!(merge_to_whole(&patches, &grid).is_err());
    }

    #[test]
    fn test_scaled_grid() {
        let grid = MergeGrid { rows: 3, cols: 2, patch: 8, stride: 4 };
        let up = grid.scaled(2);
        assert_eq!(up.merged_size(), (2 * grid.merged_size().0, 2 * grid.merged_size().1));
    }
}
