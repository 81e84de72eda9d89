//! Super-resolution dataset over a directory of images
//!
//! An [`SrDataset`] knows how to turn every image in its directory into
//! (input, target) patch pairs and persist them to a [`PatchStore`]. Training
//! reads the store; whole-image evaluation slices source images on demand.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::image_ops::{degrade, SrImage};
use super::patches::{slice_patches, MergeGrid, SliceMode};
use super::store::{store_exists, PatchStore, PatchStoreWriter, StoreManifest};
use crate::utils::error::{Result, SrError};

/// File extensions picked up when scanning an image directory
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Default subdirectory name for the patch store
pub const DEFAULT_STORE_DIR: &str = ".patches";

/// Patch slicing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Distance between windows, in HR pixels
    pub stride: usize,
    /// Downsampling factor between HR targets and LR inputs
    pub scale: usize,
    /// Side of an LR patch; HR patches are `lr_size * scale`
    pub lr_size: usize,
    /// How windows are placed
    pub slice_mode: SliceMode,
    /// Re-interpolate LR patches to HR size (SRCNN style inputs)
    pub interpolate_input: bool,
    /// 1 for luma, 3 for RGB
    pub channels: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            stride: 16,
            scale: 2,
            lr_size: 16,
            slice_mode: SliceMode::Normal,
            interpolate_input: false,
            channels: 3,
        }
    }
}

impl DatasetConfig {
    /// Side of an HR target patch
    pub fn hr_size(&self) -> usize {
        self.lr_size * self.scale
    }

    /// Side of a network input patch
    pub fn input_size(&self) -> usize {
        if self.interpolate_input {
            self.hr_size()
        } else {
            self.lr_size
        }
    }

    pub fn data_shape(&self) -> [usize; 3] {
        [self.channels, self.input_size(), self.input_size()]
    }

    pub fn label_shape(&self) -> [usize; 3] {
        [self.channels, self.hr_size(), self.hr_size()]
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scale == 0 {
            return Err(SrError::Config("scale must be at least 1".to_string()));
        }
        if self.lr_size == 0 {
            return Err(SrError::Config("lr_size must be positive".to_string()));
        }
        if self.stride == 0 {
            return Err(SrError::Config("stride must be positive".to_string()));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(SrError::Config(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if let SliceMode::Random { per_image: 0, .. } = self.slice_mode {
            return Err(SrError::Config(
                "random slicing needs at least one patch per image".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input and target patches cut from one image
#[derive(Debug, Clone)]
pub struct PatchPairs {
    pub data: Vec<SrImage>,
    pub label: Vec<SrImage>,
    /// Grid of the HR label patches, present for normal slicing
    pub grid: Option<MergeGrid>,
}

/// A directory of images plus its materialized patch store
#[derive(Debug, Clone)]
pub struct SrDataset {
    image_dir: PathBuf,
    store_dir: PathBuf,
    config: DatasetConfig,
}

impl SrDataset {
    /// Dataset over `image_dir`, storing patches in `image_dir/.patches`
    pub fn new(image_dir: impl Into<PathBuf>, config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        let image_dir = image_dir.into();
        let store_dir = image_dir.join(DEFAULT_STORE_DIR);
        Ok(Self {
            image_dir,
            store_dir,
            config,
        })
    }

    /// Use a different directory for the patch store
    pub fn with_store_dir(mut self, store_dir: impl Into<PathBuf>) -> Self {
        self.store_dir = store_dir.into();
        self
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn stride(&self) -> usize {
        self.config.stride
    }

    pub fn scale(&self) -> usize {
        self.config.scale
    }

    pub fn lr_size(&self) -> usize {
        self.config.lr_size
    }

    pub fn slice_mode(&self) -> SliceMode {
        self.config.slice_mode
    }

    /// Whether the patch store has been written
    pub fn is_saved(&self) -> bool {
        store_exists(&self.store_dir)
    }

    /// Image files under the directory, sorted, skipping the store itself
    pub fn image_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.image_dir.is_dir() {
            return Err(SrError::Dataset(format!(
                "Image directory not found: {:?}",
                self.image_dir
            )));
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(&self.image_dir)
            .into_iter()
            .filter_entry(|e| e.path() != self.store_dir.as_path())
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_image_file(p))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Names of the images relative to the directory
    pub fn image_names(&self) -> Result<Vec<String>> {
        Ok(self
            .image_paths()?
            .iter()
            .map(|p| self.relative_name(p))
            .collect())
    }

    fn relative_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.image_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// Slice one decoded HR image into (input, target) pairs
    ///
    /// `image_name` is the path relative to the image directory; random
    /// slicing derives the image's windows from it.
    pub fn slice_image(&self, hr: &SrImage, image_name: &str) -> Result<PatchPairs> {
        let hr = hr.mod_crop(self.config.scale);
        let (label, grid) = slice_patches(
            &hr,
            self.config.hr_size(),
            self.config.stride,
            self.config.slice_mode.for_image(image_name),
        )?;

        let data = label
            .iter()
            .map(|patch| degrade(patch, self.config.scale, self.config.interpolate_input))
            .collect::<Result<Vec<_>>>()?;

        Ok(PatchPairs { data, label, grid })
    }

    /// Patches of a single named image, straight from the source file
    pub fn data_label(&self, image_name: &str) -> Result<PatchPairs> {
        let path = self.image_dir.join(image_name);
        let hr = SrImage::open(&path, self.config.channels)?;
        self.slice_image(&hr, image_name)
    }

    /// Materialize every image's patches into the store
    ///
    /// Images that cannot be decoded or are smaller than one patch are skipped
    /// with a warning.
    pub fn save(&self) -> Result<StoreManifest> {
        let paths = self.image_paths()?;
        if paths.is_empty() {
            return Err(SrError::Dataset(format!(
                "No images found in {:?}",
                self.image_dir
            )));
        }

        info!(
            "Slicing {} images from {:?} into {:?}",
            paths.len(),
            self.image_dir,
            self.store_dir
        );

        let pb = ProgressBar::new(paths.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let mut writer = PatchStoreWriter::create(
            &self.store_dir,
            self.config.data_shape(),
            self.config.label_shape(),
        )?;

        // Decode in parallel chunks, write sequentially to keep row order stable
        let chunk_size = rayon::current_num_threads().max(1) * 4;
        for chunk in paths.chunks(chunk_size) {
            let sliced: Vec<(PathBuf, Result<PatchPairs>)> = chunk
                .par_iter()
                .map(|path| {
                    let name = self.relative_name(path);
                    let pairs = SrImage::open(path, self.config.channels)
                        .and_then(|hr| self.slice_image(&hr, &name));
                    (path.clone(), pairs)
                })
                .collect();

            for (path, pairs) in sliced {
                pb.inc(1);
                match pairs {
                    Ok(pairs) => {
                        for (data, label) in pairs.data.iter().zip(pairs.label.iter()) {
                            writer.append(&data.data, &label.data)?;
                        }
                        writer.mark_image();
                    }
                    Err(e) => warn!("Skipping {:?}: {}", path, e),
                }
            }
        }
        pb.finish_and_clear();

        if writer.is_empty() {
            return Err(SrError::Dataset(format!(
                "No patches could be cut from {:?}",
                self.image_dir
            )));
        }
        writer.finish()
    }

    /// Open the materialized store
    pub fn open_store(&self) -> Result<PatchStore> {
        if !self.is_saved() {
            return Err(SrError::DatasetNotSaved(self.store_dir.clone()));
        }
        PatchStore::open(&self.store_dir)
    }

    /// Number of stored patches
    pub fn num_data(&self) -> Result<usize> {
        Ok(self.open_store()?.len())
    }
}

/// Whether a path has a known image extension
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a smooth synthetic RGB image
    pub(crate) fn write_test_image(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([
                ((x * 255) / width.max(1)) as u8,
                ((y * 255) / height.max(1)) as u8,
                (((x + y) * 127) / (width + height).max(1)) as u8,
            ])
        });
        img.save(path).unwrap();
    }

    fn config() -> DatasetConfig {
        DatasetConfig {
            stride: 8,
            scale: 2,
            lr_size: 8,
            slice_mode: SliceMode::Normal,
            interpolate_input: false,
            channels: 3,
        }
    }

    #[test]
    fn test_config_shapes() {
        let mut cfg = config();
        assert_eq!(cfg.hr_size(), 16);
        assert_eq!(cfg.data_shape(), [3, 8, 8]);
        assert_eq!(cfg.label_shape(), [3, 16, 16]);

        cfg.interpolate_input = true;
        assert_eq!(cfg.data_shape(), [3, 16, 16]);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config();
        cfg.channels = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.stride = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.slice_mode = SliceMode::Random { per_image: 0, seed: 1 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_save_materializes_store() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_test_image(&dir.path().join("a.png"), 32, 32);
        write_test_image(&dir.path().join("b.png"), 40, 32);
        std::fs::write(dir.path().join("notes.txt"), "not an image")?;

        let dataset = SrDataset::new(dir.path(), config())?;
        assert!(!dataset.is_saved());
        assert!(matches!(dataset.num_data(), Err(SrError::DatasetNotSaved(_))));

        let manifest = dataset.save()?;
        assert!(dataset.is_saved());
        assert_eq!(manifest.num_images, 2);
        // a: 3x3 windows, b: 3 rows x 4 cols
        assert_eq!(manifest.num_data, 9 + 12);
        assert_eq!(dataset.num_data()?, 21);

        // The store directory is not picked up as an image source
        assert_eq!(dataset.image_names()?, vec!["a.png", "b.png"]);
        Ok(())
    }

    #[test]
    fn test_data_label_shapes() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_test_image(&dir.path().join("img.png"), 33, 32);

        let dataset = SrDataset::new(dir.path(), config())?;
        let pairs = dataset.data_label("img.png")?;
        let grid = pairs.grid.unwrap();

        assert_eq!(pairs.data.len(), grid.len());
        assert_eq!(pairs.label.len(), grid.len());
        assert_eq!((pairs.data[0].height, pairs.label[0].height), (8, 16));
        Ok(())
    }

    #[test]
    fn test_random_slicing_varies_between_images() -> Result<()> {
        let dir = TempDir::new().unwrap();
        // Identical pixels, so only the window positions can differ
        write_test_image(&dir.path().join("a.png"), 32, 32);
        write_test_image(&dir.path().join("b.png"), 32, 32);

        let cfg = DatasetConfig {
            slice_mode: SliceMode::Random { per_image: 4, seed: 7 },
            ..config()
        };
        let dataset = SrDataset::new(dir.path(), cfg)?;
        let a = dataset.data_label("a.png")?;
        let b = dataset.data_label("b.png")?;

        assert_eq!(a.label.len(), 4);
        assert_ne!(a.label, b.label);
        assert_eq!(a.label, dataset.data_label("a.png")?.label);
        Ok(())
    }

    #[test]
    fn test_save_empty_directory_fails() {
        let dir = TempDir::new().unwrap();
        let dataset = SrDataset::new(dir.path(), config()).unwrap();
        assert!(dataset.save().is_err());
    }
}
