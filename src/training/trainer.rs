//! Training loop
//!
//! A custom loop on Burn's optimizer API rather than the high-level
//! `LearnerBuilder`: batches are cut lazily from the patch store each epoch,
//! validation runs on the non-autodiff module, and only the best weights by
//! validation loss are kept on disk.

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use super::checkpoint::{BestCheckpoint, CheckpointMetadata, MonitorMode};
use super::events::EventLog;
use super::{EpochRecord, FitConfig, FitHistory, SrLoss, MONITOR};
use crate::dataset::{PatchFlow, PatchStoreDataset, SrBatch, SrBatcher, SrDataset, SrImage};
use crate::model::{SrModel, SrNetwork};
use crate::utils::error::{Result, SrError};
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::{batch_psnr, MetricMeter};

impl<B, N> SrModel<B, N>
where
    B: AutodiffBackend,
    N: SrNetwork<B> + AutodiffModule<B>,
    N::InnerModule: SrNetwork<B::InnerBackend>,
{
    /// Train on `train_dst`, validating on `val_dst` after every epoch
    ///
    /// Both datasets must have been saved; otherwise this fails with
    /// `DatasetNotSaved` before any training step. Returns the trained
    /// network, which also replaces this model's network, and the per-epoch
    /// history. The best weights by validation loss are written to
    /// [`SrModel::weight_path`].
    pub fn fit(
        &mut self,
        train_dst: &SrDataset,
        val_dst: &SrDataset,
        config: &FitConfig,
    ) -> Result<(N, FitHistory)> {
        config.validate()?;
        for dst in [train_dst, val_dst] {
            if !dst.is_saved() {
                return Err(SrError::DatasetNotSaved(dst.store_dir().to_path_buf()));
            }
        }

        let train_set = PatchStoreDataset::new(train_dst.open_store()?);
        let val_set = PatchStoreDataset::new(val_dst.open_store()?);
        self.check_shapes(train_set.data_shape(), train_set.label_shape())?;
        self.check_shapes(val_set.data_shape(), val_set.label_shape())?;
        if train_set.store().is_empty() || val_set.store().is_empty() {
            return Err(SrError::Dataset("Cannot fit on an empty patch store".to_string()));
        }

        let batcher = SrBatcher::for_dataset(&train_set);
        let mut train_flow = PatchFlow::new(train_set, config.batch_size, config.shuffle, config.seed)?;
        let mut val_flow = PatchFlow::new(val_set, config.batch_size, false, config.seed)?;
        if config.multiprocess {
            train_flow = train_flow.with_workers(config.workers)?;
            val_flow = val_flow.with_workers(config.workers)?;
        }

        info!(
            "Training {} on {} patches, validating on {} | batch {} | lr {} | loss {} | {} epochs",
            self.name(),
            train_flow.len(),
            val_flow.len(),
            config.batch_size,
            config.learning_rate,
            config.loss,
            config.nb_epochs
        );

        let mut optimizer = AdamConfig::new().init();
        let mut checkpoint = BestCheckpoint::new(self.weight_path(), MONITOR, MonitorMode::Min);
        let mut events = if config.save_history {
            Some(EventLog::create(&config.log_dir, self.name())?)
        } else {
            None
        };
        let mut logger = TrainingLogger::new(self.name(), config.nb_epochs);

        let device = self.device().clone();
        let mut network = self.network().clone();
        let mut history = FitHistory::default();
        let mut step = 0usize;

        for epoch in 0..config.nb_epochs {
            logger.start_epoch(epoch);

            let batches = train_flow.epoch_batches();
            let pb = epoch_progress(batches.len(), epoch + 1, config.nb_epochs);
            let mut loss_meter = MetricMeter::new();
            let mut psnr_meter = MetricMeter::new();

            for indices in batches {
                let items = train_flow.load(&indices);
                if items.is_empty() {
                    continue;
                }
                let n = items.len();
                let batch: SrBatch<B> = batcher.batch(items, &device);

                let output = network.forward(batch.inputs);
                let loss = config.loss.forward(output.clone(), batch.targets.clone());

                let loss_value: f64 = loss.clone().into_scalar().elem();
                let psnr_value = batch_psnr(output.detach(), batch.targets);

                let grads = GradientsParams::from_grads(loss.backward(), &network);
                network = optimizer.step(config.learning_rate, network, grads);

                loss_meter.update(loss_value, n);
                psnr_meter.update(psnr_value, n);
                if let Some(events) = events.as_mut() {
                    events.scalar("train/loss", loss_value, step);
                    events.scalar("train/psnr", psnr_value, step);
                }
                step += 1;

                pb.set_message(format!("loss {:.6} | psnr {:.2}", loss_value, psnr_value));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let valid = network.valid();
            let (val_loss, val_psnr) = evaluate_patches(&valid, &mut val_flow, &batcher, config.loss, &device);

            let record = EpochRecord {
                epoch: epoch + 1,
                train_loss: loss_meter.average(),
                train_psnr: psnr_meter.average(),
                val_loss,
                val_psnr,
            };
            logger.end_epoch(record.train_loss, record.val_loss, record.val_psnr);

            if let Some(events) = events.as_mut() {
                let epoch_step = epoch + 1;
                events.scalar("epoch/loss", record.train_loss, epoch_step);
                events.scalar("epoch/psnr", record.train_psnr, epoch_step);
                events.scalar("epoch/val_loss", record.val_loss, epoch_step);
                events.scalar("epoch/val_psnr", record.val_psnr, epoch_step);
                if config.weight_histograms {
                    log_weight_histograms(events, &valid, epoch_step)?;
                }
                if config.sr_images {
                    if let Some(sr) = sample_prediction(&valid, &val_flow, &batcher, &device)? {
                        events.image("val/sr", &sr, epoch_step)?;
                    }
                }
                events.flush();
            }

            let metadata = CheckpointMetadata::new(
                self.name(),
                epoch + 1,
                MONITOR,
                val_loss,
                val_psnr,
                self.num_params(),
            );
            if checkpoint.update::<B::InnerBackend, _>(&valid, &metadata)? {
                logger.log_new_best(val_loss, &self.weight_file());
            } else {
                debug!("{} did not improve from {:?}", MONITOR, checkpoint.best());
            }

            history.epochs.push(record);
        }

        history.best_epoch = checkpoint.best_epoch();
        history.best_val_loss = checkpoint.best();
        history.steps = step;

        logger.log_complete(checkpoint.best().unwrap_or(f64::NAN));
        self.set_network(network.clone());
        Ok((network, history))
    }
}

/// Mean loss and PSNR of `network` over every patch of `flow`
pub fn evaluate_patches<B: Backend, M: SrNetwork<B>>(
    network: &M,
    flow: &mut PatchFlow,
    batcher: &SrBatcher,
    loss: SrLoss,
    device: &B::Device,
) -> (f64, f64) {
    let mut loss_meter = MetricMeter::new();
    let mut psnr_meter = MetricMeter::new();

    for indices in flow.epoch_batches() {
        let items = flow.load(&indices);
        if items.is_empty() {
            continue;
        }
        let n = items.len();
        let batch: SrBatch<B> = batcher.batch(items, device);

        let output = network.forward(batch.inputs);
        let loss_value: f64 = loss
            .forward(output.clone(), batch.targets.clone())
            .into_scalar()
            .elem();

        loss_meter.update(loss_value, n);
        psnr_meter.update(batch_psnr(output, batch.targets), n);
    }

    (loss_meter.average(), psnr_meter.average())
}

/// One histogram per convolution kernel, tagged `weights/<layer>`
fn log_weight_histograms<B: Backend, M: SrNetwork<B>>(
    events: &mut EventLog,
    network: &M,
    step: usize,
) -> Result<()> {
    for (name, kernel) in network.kernels() {
        let values: Vec<f32> = kernel
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| SrError::Model(format!("Failed to read kernel {}: {:?}", name, e)))?;
        events.histogram(&format!("weights/{}", name), &values, step);
    }
    Ok(())
}

/// Network output for the first patch of `flow`, clamped to `[0, 1]`
fn sample_prediction<B: Backend, M: SrNetwork<B>>(
    network: &M,
    flow: &PatchFlow,
    batcher: &SrBatcher,
    device: &B::Device,
) -> Result<Option<SrImage>> {
    let Some(item) = flow.dataset().get(0) else {
        return Ok(None);
    };

    let inputs = batcher.inputs::<B>(&[item.data.as_slice()], device);
    let output = network.forward(inputs).clamp(0.0, 1.0);
    let [_, c, h, w] = output.dims();
    let values: Vec<f32> = output
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| SrError::Model(format!("Failed to read network output: {:?}", e)))?;

    Ok(Some(SrImage::new(c, h, w, values)?))
}

fn epoch_progress(num_batches: usize, epoch: usize, total_epochs: usize) -> ProgressBar {
    let pb = ProgressBar::new(num_batches as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(format!("Epoch {}/{}", epoch, total_epochs));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::sr_dataset::tests::write_test_image;
    use crate::dataset::{DatasetConfig, SliceMode};
    use crate::model::{Edsr, EdsrConfig, Srcnn, SrcnnConfig};
    use crate::training::events::event_files;
    use crate::training::events::tests::count_records;
    use burn::backend::Autodiff;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn dataset_config(interpolate_input: bool) -> DatasetConfig {
        DatasetConfig {
            stride: 8,
            scale: 2,
            lr_size: 4,
            slice_mode: SliceMode::Normal,
            interpolate_input,
            channels: 3,
        }
    }

    fn saved_dataset(dir: &Path, interpolate_input: bool) -> SrDataset {
        write_test_image(&dir.join("a.png"), 16, 16);
        write_test_image(&dir.join("b.png"), 16, 24);
        let dataset = SrDataset::new(dir, dataset_config(interpolate_input)).unwrap();
        dataset.save().unwrap();
        dataset
    }

    fn fit_config(log_dir: &Path) -> FitConfig {
        FitConfig {
            batch_size: 4,
            learning_rate: 1e-3,
            nb_epochs: 2,
            log_dir: log_dir.to_path_buf(),
            ..FitConfig::default()
        }
    }

    fn tiny_edsr(weight_dir: &Path) -> SrModel<TestBackend, Edsr<TestBackend>> {
        let config = EdsrConfig::new().with_n(4).with_nb_residual(1);
        SrModel::new("x2", [4, 4], 3, config, &Default::default())
            .unwrap()
            .with_weight_dir(weight_dir)
    }

    #[test]
    fn test_fit_unsaved_dataset_fails_before_training() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_test_image(&data.path().join("a.png"), 16, 16);
        let unsaved = SrDataset::new(data.path(), dataset_config(false)).unwrap();

        let mut model = tiny_edsr(&out.path().join("weights"));
        let result = model.fit(&unsaved, &unsaved, &fit_config(&out.path().join("logs")));

        assert!(matches!(result, Err(SrError::DatasetNotSaved(_))));
        assert!(!model.weight_file().exists());
        assert!(!out.path().join("logs").exists());
    }

    #[test]
    fn test_fit_writes_best_weights_and_events() {
        let train_dir = TempDir::new().unwrap();
        let val_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let train = saved_dataset(train_dir.path(), false);
        let val = saved_dataset(val_dir.path(), false);

        let mut model = tiny_edsr(&out.path().join("weights"));
        let (network, history) = model
            .fit(&train, &val, &fit_config(&out.path().join("logs")))
            .unwrap();

        assert_eq!(history.epochs.len(), 2);
        // 4 + 6 patches, batches of 4
        assert_eq!(history.steps, 2 * 3);
        assert!(history.best_epoch.is_some());
        assert!(history.epochs.iter().all(|r| r.val_loss.is_finite()));
        assert!(model.weight_file().is_file());

        // The returned network is the one the model now holds
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &Default::default());
        let returned: Vec<f32> = network.forward(input.clone()).into_data().to_vec().unwrap();
        let held: Vec<f32> = model.network().forward(input).into_data().to_vec().unwrap();
        assert_eq!(returned, held);

        let files = event_files(&out.path().join("logs").join("EDSRx2")).unwrap();
        assert_eq!(files.len(), 1);
        // 2 scalars per step, 4 per epoch, plus histograms and images
        assert!(count_records(&files[0]) > 6 * 2 + 2 * 4);

        // The saved weights can be loaded into a fresh model
        let mut reloaded = tiny_edsr(&out.path().join("weights"));
        reloaded.create_model(true).unwrap();
    }

    #[test]
    fn test_fit_srcnn_mae_without_history() {
        let train_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let train = saved_dataset(train_dir.path(), true);

        let config = SrcnnConfig::new().with_n1(4).with_n2(2).with_f1(3).with_f3(3);
        let mut model: SrModel<TestBackend, Srcnn<TestBackend>> =
            SrModel::new("", [8, 8], 3, config, &Default::default())
                .unwrap()
                .with_weight_dir(out.path().join("weights"));

        let fit = FitConfig {
            loss: SrLoss::Mae,
            save_history: false,
            nb_epochs: 1,
            multiprocess: true,
            workers: 2,
            ..fit_config(&out.path().join("logs"))
        };
        let (_, history) = model.fit(&train, &train, &fit).unwrap();

        assert_eq!(history.epochs.len(), 1);
        assert!(!out.path().join("logs").exists());
    }

    #[test]
    fn test_fit_rejects_mismatched_shapes() {
        let train_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let train = saved_dataset(train_dir.path(), true);

        // Interpolated inputs are 8x8, the EDSR model expects 4x4
        let mut model = tiny_edsr(&out.path().join("weights"));
        let result = model.fit(&train, &train, &fit_config(&out.path().join("logs")));
        assert!(matches!(result, Err(SrError::Model(_))));
    }
}
