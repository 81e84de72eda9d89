//! Inference module for whole-image super-resolution
//!
//! This module provides:
//! - `SrModel::gen_sr_img`: slice one image, predict every patch in batches,
//!   merge the outputs back into a full SR image and score it
//! - `SrModel::evaluate`: mean PSNR over every image of a dataset
//!
//! Only normally sliced datasets can be merged back into whole images.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::{downsample, merge_to_whole, SliceMode, SrBatcher, SrDataset, SrImage};
use crate::model::{SrModel, SrNetwork};
use crate::utils::error::{Result, SrError};
use crate::utils::metrics::{psnr, DEFAULT_PEAK};

/// Suffix appended to the image stem of saved SR images
pub const SR_SUFFIX: &str = "_SR";

/// Result of super-resolving one image
#[derive(Debug, Clone)]
pub struct SrOutput {
    /// Ground truth, merged from the label patches
    pub hr: SrImage,
    /// The HR image downsampled by the dataset scale
    pub lr: SrImage,
    /// Network output, merged from the predicted patches
    pub sr: SrImage,
    /// PSNR(SR, HR) in dB
    pub psnr: f64,
}

/// Per-image scores of an evaluation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model_name: String,
    pub images: Vec<ImageScore>,
    /// Images that could not be decoded or are smaller than one patch
    pub skipped: Vec<String>,
    pub mean_psnr: f64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageScore {
    pub image_name: String,
    pub psnr: f64,
}

/// Where `gen_sr_img` writes the SR image of `image_name`
pub fn sr_image_path(output_dir: &Path, image_name: &str) -> PathBuf {
    let name = Path::new(image_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| image_name.to_string());
    let file = format!("{}{}.png", stem, SR_SUFFIX);

    match name.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => output_dir.join(parent).join(file),
        _ => output_dir.join(file),
    }
}

impl<B: Backend, N: SrNetwork<B>> SrModel<B, N> {
    /// Super-resolve one image of `test_dst`
    ///
    /// # Arguments
    /// * `image_name` - Path of the image relative to the dataset directory
    /// * `save` - Write the SR image to `<output_dir>/<stem>_SR.png`
    /// * `verbose` - Log the PSNR of this image
    pub fn gen_sr_img(
        &self,
        test_dst: &SrDataset,
        image_name: &str,
        save: bool,
        verbose: bool,
    ) -> Result<SrOutput> {
        if test_dst.slice_mode() != SliceMode::Normal {
            return Err(SrError::IncompleteBlocks(test_dst.slice_mode().to_string()));
        }

        let pairs = test_dst.data_label(image_name)?;
        let grid = pairs
            .grid
            .ok_or_else(|| SrError::IncompleteBlocks(test_dst.slice_mode().to_string()))?;
        let (Some(first_data), Some(first_label)) = (pairs.data.first(), pairs.label.first()) else {
            return Err(SrError::Dataset(format!(
                "Image '{}' is smaller than one patch",
                image_name
            )));
        };

        let data_shape = [first_data.channels, first_data.height, first_data.width];
        let label_shape = [first_label.channels, first_label.height, first_label.width];
        self.check_shapes(data_shape, label_shape)?;

        let outputs = self.predict_patches(&pairs.data, data_shape, label_shape)?;

        let hr = merge_to_whole(&pairs.label, &grid)?;
        let sr = merge_to_whole(&outputs, &grid)?;
        let lr = downsample(&hr, test_dst.scale())?;
        let psnr = psnr(&sr.data, &hr.data, DEFAULT_PEAK)?;

        if verbose {
            info!("{}: PSNR {:.4} dB ({} patches)", image_name, psnr, outputs.len());
        } else {
            debug!("{}: PSNR {:.4} dB", image_name, psnr);
        }

        if save {
            let path = sr_image_path(self.output_dir(), image_name);
            sr.save(&path)?;
            info!("Saved SR image to {:?}", path);
        }

        Ok(SrOutput { hr, lr, sr, psnr })
    }

    /// Mean PSNR over every image of `test_dst`
    ///
    /// Images that cannot be decoded or are smaller than one patch are
    /// skipped with a warning. Fails if no image can be scored.
    pub fn evaluate(&self, test_dst: &SrDataset, verbose: bool) -> Result<EvaluationReport> {
        let names = test_dst.image_names()?;
        if names.is_empty() {
            return Err(SrError::Dataset(format!(
                "No images to evaluate in {:?}",
                test_dst.image_dir()
            )));
        }

        let start = Instant::now();
        let mut images = Vec::with_capacity(names.len());
        let mut skipped = Vec::new();
        for name in names {
            match self.gen_sr_img(test_dst, &name, false, verbose) {
                Ok(output) => images.push(ImageScore {
                    image_name: name,
                    psnr: output.psnr,
                }),
                Err(e @ (SrError::ImageLoad(..) | SrError::Image(_) | SrError::Dataset(_))) => {
                    warn!("Skipping {}: {}", name, e);
                    skipped.push(name);
                }
                Err(e) => return Err(e),
            }
        }
        if images.is_empty() {
            return Err(SrError::Dataset(format!(
                "None of the {} images in {:?} could be scored",
                skipped.len(),
                test_dst.image_dir()
            )));
        }

        let mean_psnr = images.iter().map(|s| s.psnr).sum::<f64>() / images.len() as f64;
        info!(
            "{}: average PSNR {:.4} dB over {} images",
            self.name(),
            mean_psnr,
            images.len()
        );

        Ok(EvaluationReport {
            model_name: self.name().to_string(),
            images,
            skipped,
            mean_psnr,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Run the network over patches in batches, clamping outputs to `[0, 1]`
    fn predict_patches(
        &self,
        patches: &[SrImage],
        data_shape: [usize; 3],
        label_shape: [usize; 3],
    ) -> Result<Vec<SrImage>> {
        let batcher = SrBatcher::new(data_shape, label_shape);
        let [c, h, w] = label_shape;
        let mut outputs = Vec::with_capacity(patches.len());

        for chunk in patches.chunks(self.predict_batch_size()) {
            let rows: Vec<&[f32]> = chunk.iter().map(|p| p.data.as_slice()).collect();
            let inputs = batcher.inputs::<B>(&rows, self.device());

            let predicted = self.network().forward(inputs).clamp(0.0, 1.0);
            let values: Vec<f32> = predicted
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| SrError::Model(format!("Failed to read network output: {:?}", e)))?;

            for row in values.chunks_exact(c * h * w) {
                outputs.push(SrImage::new(c, h, w, row.to_vec())?);
            }
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::sr_dataset::tests::write_test_image;
    use crate::dataset::DatasetConfig;
    use crate::model::{Edsr, EdsrConfig, Srcnn, SrcnnConfig};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn dataset(dir: &Path, slice_mode: SliceMode, interpolate_input: bool) -> SrDataset {
        let config = DatasetConfig {
            stride: 4,
            scale: 2,
            lr_size: 4,
            slice_mode,
            interpolate_input,
            channels: 3,
        };
        SrDataset::new(dir, config).unwrap()
    }

    fn edsr(output_dir: &Path) -> SrModel<TestBackend, Edsr<TestBackend>> {
        let config = EdsrConfig::new().with_n(4).with_nb_residual(1);
        SrModel::new("x2", [4, 4], 3, config, &Default::default())
            .unwrap()
            .with_output_dir(output_dir)
            .with_predict_batch_size(3)
    }

    #[test]
    fn test_gen_sr_img_shapes_and_save() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_test_image(&data.path().join("butterfly.png"), 24, 16);

        let test_dst = dataset(data.path(), SliceMode::Normal, false);
        let model = edsr(out.path());
        let output = model.gen_sr_img(&test_dst, "butterfly.png", true, true).unwrap();

        assert_eq!((output.hr.height, output.hr.width), (16, 24));
        assert_eq!((output.sr.height, output.sr.width), (16, 24));
        assert_eq!((output.lr.height, output.lr.width), (8, 12));
        assert!(output.psnr.is_finite());
        assert!(output.sr.data.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(out.path().join("butterfly_SR.png").is_file());
    }

    #[test]
    fn test_gen_sr_img_requires_normal_slicing() {
        let data = TempDir::new().unwrap();
        write_test_image(&data.path().join("img.png"), 16, 16);

        let test_dst = dataset(data.path(), SliceMode::Random { per_image: 4, seed: 7 }, false);
        let model = edsr(data.path());
        let result = model.gen_sr_img(&test_dst, "img.png", false, false);

        assert!(matches!(result, Err(SrError::IncompleteBlocks(_))));
    }

    #[test]
    fn test_evaluate_averages_over_images() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_test_image(&data.path().join("a.png"), 16, 16);
        write_test_image(&data.path().join("b.png"), 16, 24);

        let test_dst = dataset(data.path(), SliceMode::Normal, true);
        let config = SrcnnConfig::new().with_n1(4).with_n2(2);
        let model: SrModel<TestBackend, Srcnn<TestBackend>> =
            SrModel::new("", [8, 8], 3, config, &Default::default())
                .unwrap()
                .with_output_dir(out.path());

        let report = model.evaluate(&test_dst, false).unwrap();
        assert_eq!(report.images.len(), 2);
        assert_eq!(report.images[0].image_name, "a.png");

        let expected = (report.images[0].psnr + report.images[1].psnr) / 2.0;
        assert!((report.mean_psnr - expected).abs() < 1e-9);
        // Evaluation never writes images
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_evaluate_skips_images_smaller_than_a_patch() {
        let data = TempDir::new().unwrap();
        write_test_image(&data.path().join("a.png"), 16, 16);
        write_test_image(&data.path().join("tiny.png"), 6, 6);

        let test_dst = dataset(data.path(), SliceMode::Normal, false);
        let report = edsr(data.path()).evaluate(&test_dst, false).unwrap();

        assert_eq!(report.images.len(), 1);
        assert_eq!(report.images[0].image_name, "a.png");
        assert_eq!(report.skipped, vec!["tiny.png".to_string()]);
        assert!((report.mean_psnr - report.images[0].psnr).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_fails_when_nothing_can_be_scored() {
        let data = TempDir::new().unwrap();
        write_test_image(&data.path().join("tiny.png"), 6, 6);

        let test_dst = dataset(data.path(), SliceMode::Normal, false);
        let result = edsr(data.path()).evaluate(&test_dst, false);
        assert!(matches!(result, Err(SrError::Dataset(_))));
    }

    #[test]
    fn test_evaluate_empty_directory_fails() {
        let data = TempDir::new().unwrap();
        let test_dst = dataset(data.path(), SliceMode::Normal, false);
        assert!(edsr(data.path()).evaluate(&test_dst, false).is_err());
    }

    #[test]
    fn test_sr_image_path() {
        let out = Path::new("results");
        assert_eq!(sr_image_path(out, "set5/bird.bmp"), PathBuf::from("results/set5/bird_SR.png"));
        assert_eq!(sr_image_path(out, "bird.png"), PathBuf::from("results/bird_SR.png"));
    }
}
