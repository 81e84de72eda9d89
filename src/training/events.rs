//! TensorBoard event log
//!
//! Training history goes to `<log_dir>/<model_name>/events.out.tfevents.*`
//! through `tensorboard-rs`, so a run can be followed with
//! `tensorboard --logdir <log_dir>`.

use std::fs;
use std::path::{Path, PathBuf};

use tensorboard_rs::summary_writer::SummaryWriter;
use tracing::debug;

use crate::dataset::SrImage;
use crate::utils::error::Result;

/// File name prefix TensorBoard scans for
pub const EVENT_FILE_PREFIX: &str = "events.out.tfevents";

/// Buckets per weight histogram
pub const HISTOGRAM_BINS: usize = 30;

/// Summary of a set of values in TensorBoard's histogram layout
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub num: f64,
    pub sum: f64,
    pub sum_squares: f64,
    /// Right edge of each bucket
    pub bucket_limits: Vec<f64>,
    pub bucket_counts: Vec<f64>,
}

impl Histogram {
    /// Equal-width buckets over the finite values; `None` if there are none
    pub fn from_values(values: &[f32], bins: usize) -> Option<Self> {
        let finite: Vec<f64> = values
            .iter()
            .map(|&v| v as f64)
            .filter(|v| v.is_finite())
            .collect();
        if finite.is_empty() || bins == 0 {
            return None;
        }

        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let width = (max - min) / bins as f64;

        let mut bucket_counts = vec![0.0; bins];
        for v in &finite {
            let i = if width > 0.0 {
                (((v - min) / width) as usize).min(bins - 1)
            } else {
                0
            };
            bucket_counts[i] += 1.0;
        }

        let bucket_limits = (1..=bins)
            .map(|i| if i == bins { max } else { min + width * i as f64 })
            .collect();

        Some(Self {
            min,
            max,
            num: finite.len() as f64,
            sum: finite.iter().sum(),
            sum_squares: finite.iter().map(|v| v * v).sum(),
            bucket_limits,
            bucket_counts,
        })
    }
}

/// Event writer for one model's run
pub struct EventLog {
    dir: PathBuf,
    writer: SummaryWriter,
}

impl EventLog {
    /// Start a new event file for `model_name` under `log_dir`
    pub fn create(log_dir: &Path, model_name: &str) -> Result<Self> {
        let dir = log_dir.join(model_name);
        fs::create_dir_all(&dir)?;
        let writer = SummaryWriter::new(&dir);
        debug!("Writing TensorBoard events to {:?}", dir);

        Ok(Self { dir, writer })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.writer.add_scalar(tag, value as f32, step);
    }

    /// Histogram of `values`; skipped when none are finite
    pub fn histogram(&mut self, tag: &str, values: &[f32], step: usize) {
        let Some(h) = Histogram::from_values(values, HISTOGRAM_BINS) else {
            debug!("No finite values for histogram {}", tag);
            return;
        };
        self.writer.add_histogram_raw(
            tag,
            h.min,
            h.max,
            h.num,
            h.sum,
            h.sum_squares,
            &h.bucket_limits,
            &h.bucket_counts,
            step,
        );
    }

    /// Log an image as 8-bit RGB
    pub fn image(&mut self, tag: &str, img: &SrImage, step: usize) -> Result<()> {
        let rgb = img.to_dynamic()?.to_rgb8();
        let (width, height) = rgb.dimensions();
        self.writer
            .add_image(tag, rgb.as_raw(), &[3, height as usize, width as usize], step);
        Ok(())
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

/// TensorBoard event files in `dir`, sorted
pub fn event_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(EVENT_FILE_PREFIX))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
