//! On-disk patch store
//!
//! A store is a directory holding two fixed-width `f32` columns and a
//! manifest describing them:
//!
//! ```text
//! <store>/manifest.json   counts and per-row shapes
//! <store>/data.bin        network inputs, little-endian f32, one row per patch
//! <store>/label.bin       HR targets, same layout
//! ```
//!
//! Readers memory-map both columns and index rows directly, so any number of
//! loader threads can share one [`PatchStore`].

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::error::{Result, SrError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATA_FILE: &str = "data.bin";
pub const LABEL_FILE: &str = "label.bin";

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Store description written last, so its presence marks a complete store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Number of (data, label) rows
    pub num_data: usize,
    /// `[channels, height, width]` of one data row
    pub data_shape: [usize; 3],
    /// `[channels, height, width]` of one label row
    pub label_shape: [usize; 3],
    /// Number of source images sliced into the store
    pub num_images: usize,
    /// RFC 3339 creation time
    pub created_at: String,
}

impl StoreManifest {
    pub fn data_len(&self) -> usize {
        self.data_shape.iter().product()
    }

    pub fn label_len(&self) -> usize {
        self.label_shape.iter().product()
    }
}

/// Whether `dir` holds a complete store
pub fn store_exists(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file() && dir.join(DATA_FILE).is_file() && dir.join(LABEL_FILE).is_file()
}

/// Streaming writer for a new store
pub struct PatchStoreWriter {
    dir: PathBuf,
    data: BufWriter<File>,
    label: BufWriter<File>,
    data_shape: [usize; 3],
    label_shape: [usize; 3],
    num_data: usize,
    num_images: usize,
}

impl PatchStoreWriter {
    /// Create (or truncate) a store in `dir`
    pub fn create(dir: &Path, data_shape: [usize; 3], label_shape: [usize; 3]) -> Result<Self> {
        fs::create_dir_all(dir)?;

        // Remove a stale manifest first so a crash mid-write never looks complete
        let manifest = dir.join(MANIFEST_FILE);
        if manifest.exists() {
            fs::remove_file(&manifest)?;
        }

        let data = BufWriter::new(File::create(dir.join(DATA_FILE))?);
        let label = BufWriter::new(File::create(dir.join(LABEL_FILE))?);

        Ok(Self {
            dir: dir.to_path_buf(),
            data,
            label,
            data_shape,
            label_shape,
            num_data: 0,
            num_images: 0,
        })
    }

    /// Append one row to each column
    pub fn append(&mut self, data: &[f32], label: &[f32]) -> Result<()> {
        let data_len: usize = self.data_shape.iter().product();
        let label_len: usize = self.label_shape.iter().product();
        if data.len() != data_len || label.len() != label_len {
            return Err(SrError::Store(format!(
                "Row sizes ({}, {}) do not match store shapes ({}, {})",
                data.len(),
                label.len(),
                data_len,
                label_len
            )));
        }

        write_f32s(&mut self.data, data)?;
        write_f32s(&mut self.label, label)?;
        self.num_data += 1;
        Ok(())
    }

    /// Count one more source image
    pub fn mark_image(&mut self) {
        self.num_images += 1;
    }

    pub fn len(&self) -> usize {
        self.num_data
    }

    pub fn is_empty(&self) -> bool {
        self.num_data == 0
    }

    /// Flush both columns and write the manifest
    pub fn finish(mut self) -> Result<StoreManifest> {
        self.data.flush()?;
        self.label.flush()?;

        let manifest = StoreManifest {
            num_data: self.num_data,
            data_shape: self.data_shape,
            label_shape: self.label_shape,
            num_images: self.num_images,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        fs::write(self.dir.join(MANIFEST_FILE), json)?;

        info!(
            "Patch store written to {:?}: {} patches from {} images",
            self.dir, manifest.num_data, manifest.num_images
        );
        Ok(manifest)
    }
}

fn write_f32s<W: Write>(writer: &mut W, values: &[f32]) -> Result<()> {
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Read-only, memory-mapped view of a finished store
#[derive(Debug)]
pub struct PatchStore {
    manifest: StoreManifest,
    data: Mmap,
    label: Mmap,
}

impl PatchStore {
    /// Open the store in `dir`, checking column sizes against the manifest
    pub fn open(dir: &Path) -> Result<Self> {
        if !store_exists(dir) {
            return Err(SrError::DatasetNotSaved(dir.to_path_buf()));
        }

        let json = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest: StoreManifest = serde_json::from_str(&json)?;

        let data = map_column(&dir.join(DATA_FILE), manifest.num_data * manifest.data_len())?;
        let label = map_column(&dir.join(LABEL_FILE), manifest.num_data * manifest.label_len())?;

        debug!("Opened patch store {:?} with {} rows", dir, manifest.num_data);
        Ok(Self {
            manifest,
            data,
            label,
        })
    }

    pub fn manifest(&self) -> &StoreManifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.manifest.num_data
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.num_data == 0
    }

    /// Row `index` of the data column
    pub fn data(&self, index: usize) -> Option<Vec<f32>> {
        read_row(&self.data, index, self.manifest.data_len(), self.len())
    }

    /// Row `index` of the label column
    pub fn label(&self, index: usize) -> Option<Vec<f32>> {
        read_row(&self.label, index, self.manifest.label_len(), self.len())
    }
}

fn map_column(path: &Path, expected_values: usize) -> Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and the store is never written after
    // its manifest exists; concurrent external edits could only yield stale data.
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.len() != expected_values * F32_BYTES {
        return Err(SrError::Store(format!(
            "Column {:?} holds {} bytes, manifest expects {}",
            path,
            mmap.len(),
            expected_values * F32_BYTES
        )));
    }
    Ok(mmap)
}

fn read_row(column: &Mmap, index: usize, row_len: usize, rows: usize) -> Option<Vec<f32>> {
    if index >= rows {
        return None;
    }
    let start = index * row_len * F32_BYTES;
    let bytes = &column[start..start + row_len * F32_BYTES];
    Some(
        bytes
            .chunks_exact(F32_BYTES)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_random_access() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut writer = PatchStoreWriter::create(dir.path(), [1, 2, 2], [1, 4, 4])?;

        for i in 0..3 {
            let data = vec![i as f32; 4];
            let label = vec![i as f32 * 10.0; 16];
            writer.append(&data, &label)?;
        }
        writer.mark_image();
        let manifest = writer.finish()?;
        assert_eq!(manifest.num_data, 3);

        let store = PatchStore::open(dir.path())?;
        assert_eq!(store.len(), 3);
        assert_eq!(store.data(2), Some(vec![2.0; 4]));
        assert_eq!(store.label(1), Some(vec![10.0; 16]));
        assert_eq!(store.data(3), None);
        Ok(())
    }

    #[test]
    fn test_open_missing_store_is_not_saved() {
        let dir = TempDir::new().unwrap();
        assert!(!store_exists(dir.path()));
        assert!(matches!(
            PatchStore::open(dir.path()),
            Err(SrError::DatasetNotSaved(_))
        ));
    }

    #[test]
    fn test_unfinished_store_is_incomplete() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut writer = PatchStoreWriter::create(dir.path(), [1, 1, 1], [1, 1, 1])?;
        writer.append(&[0.5], &[0.5])?;
        drop(writer);
        assert!(!store_exists(dir.path()));
        Ok(())
    }

    #[test]
    fn test_append_rejects_wrong_row_size() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut writer = PatchStoreWriter::create(dir.path(), [1, 2, 2], [1, 2, 2])?;
        assert!(writer.append(&[0.0; 3], &[0.0; 4]).is_err());
        Ok(())
    }

    #[test]
    fn test_truncated_column_is_rejected() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut writer = PatchStoreWriter::create(dir.path(), [1, 2, 2], [1, 2, 2])?;
        writer.append(&[0.0; 4], &[0.0; 4])?;
        writer.finish()?;

        fs::write(dir.path().join(DATA_FILE), [0u8; 3])?;
        assert!(matches!(PatchStore::open(dir.path()), Err(SrError::Store(_))));
        Ok(())
    }
}
