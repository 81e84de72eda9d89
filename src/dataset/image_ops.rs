//! Image tensors and resampling
//!
//! `SrImage` is the CHW `f32` representation every other part of the
//! pipeline works on. Pixel values are normalized to `[0, 1]`.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, ImageReader, Luma, Rgb, RgbImage};

use crate::utils::error::{Result, SrError};

/// Resampling filter used for both shrinking and re-interpolation
pub const RESAMPLE_FILTER: FilterType = FilterType::CatmullRom;

/// A multi-channel image stored as a flattened CHW array
#[derive(Debug, Clone, PartialEq)]
pub struct SrImage {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Flattened `[channels, height, width]` values in [0, 1]
    pub data: Vec<f32>,
}

impl SrImage {
    /// Build an image from raw CHW data
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(SrError::Image(format!(
                "Buffer of {} values does not match {}x{}x{}",
                data.len(),
                channels,
                height,
                width
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// All-zero image
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    /// Decode an image file, converting to `channels` (1 = luma, 3 = RGB)
    pub fn open(path: &Path, channels: usize) -> Result<Self> {
        let img = ImageReader::open(path)
            .map_err(|e| SrError::ImageLoad(path.to_path_buf(), e.to_string()))?
            .decode()
            .map_err(|e| SrError::ImageLoad(path.to_path_buf(), e.to_string()))?;

        Self::from_dynamic(&img, channels)
    }

    /// Convert a decoded image into CHW floats
    pub fn from_dynamic(img: &DynamicImage, channels: usize) -> Result<Self> {
        match channels {
            1 => {
                let gray = img.to_luma8();
                let (width, height) = gray.dimensions();
                let data = gray.pixels().map(|p| p[0] as f32 / 255.0).collect();
                Self::new(1, height as usize, width as usize, data)
            }
            3 => {
                let rgb = img.to_rgb8();
                let (width, height) = rgb.dimensions();
                let num_pixels = (width * height) as usize;
                let mut data = vec![0.0f32; 3 * num_pixels];

                // CHW layout: all R values, then all G values, then all B values
                for (i, pixel) in rgb.pixels().enumerate() {
                    data[i] = pixel[0] as f32 / 255.0;
                    data[num_pixels + i] = pixel[1] as f32 / 255.0;
                    data[2 * num_pixels + i] = pixel[2] as f32 / 255.0;
                }

                Self::new(3, height as usize, width as usize, data)
            }
            other => Err(SrError::Image(format!(
                "Unsupported channel count {} (expected 1 or 3)",
                other
            ))),
        }
    }

    /// Convert back to an 8-bit image, clamping values to [0, 1]
    pub fn to_dynamic(&self) -> Result<DynamicImage> {
        let (w, h) = (self.width as u32, self.height as u32);
        let plane = self.height * self.width;
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

        match self.channels {
            1 => {
                let gray: GrayImage = ImageBuffer::from_fn(w, h, |x, y| {
                    let i = y as usize * self.width + x as usize;
                    Luma([to_u8(self.data[i])])
                });
                Ok(DynamicImage::ImageLuma8(gray))
            }
            3 => {
                let rgb: RgbImage = ImageBuffer::from_fn(w, h, |x, y| {
                    let i = y as usize * self.width + x as usize;
                    Rgb([
                        to_u8(self.data[i]),
                        to_u8(self.data[plane + i]),
                        to_u8(self.data[2 * plane + i]),
                    ])
                });
                Ok(DynamicImage::ImageRgb8(rgb))
            }
            other => Err(SrError::Image(format!(
                "Cannot encode image with {} channels",
                other
            ))),
        }
    }

    /// Write the image; format is inferred from the extension
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.to_dynamic()?.save(path)?;
        Ok(())
    }

    /// Copy out a `size x size` window starting at (`top`, `left`)
    pub fn crop(&self, top: usize, left: usize, size: usize) -> Self {
        let mut data = Vec::with_capacity(self.channels * size * size);
        for c in 0..self.channels {
            let plane = c * self.height * self.width;
            for y in top..top + size {
                let row = plane + y * self.width;
                data.extend_from_slice(&self.data[row + left..row + left + size]);
            }
        }
        Self {
            channels: self.channels,
            height: size,
            width: size,
            data,
        }
    }

    /// Crop so both sides are multiples of `scale`
    pub fn mod_crop(&self, scale: usize) -> Self {
        let height = self.height - self.height % scale;
        let width = self.width - self.width % scale;
        if height == self.height && width == self.width {
            return self.clone();
        }

        let mut data = Vec::with_capacity(self.channels * height * width);
        for c in 0..self.channels {
            let plane = c * self.height * self.width;
            for y in 0..height {
                let row = plane + y * self.width;
                data.extend_from_slice(&self.data[row..row + width]);
            }
        }
        Self {
            channels: self.channels,
            height,
            width,
            data,
        }
    }
}

/// Resize each channel plane with the bicubic filter
pub fn interpolate(img: &SrImage, width: usize, height: usize) -> Result<SrImage> {
    if img.width == width && img.height == height {
        return Ok(img.clone());
    }

    let plane = img.height * img.width;
    let mut data = Vec::with_capacity(img.channels * width * height);

    for c in 0..img.channels {
        let values = img
            .data
            .get(c * plane..(c + 1) * plane)
            .ok_or_else(|| SrError::Image(format!("Channel {} is missing pixel data", c)))?
            .to_vec();
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(img.width as u32, img.height as u32, values).ok_or_else(|| {
                SrError::Image(format!(
                    "Pixel buffer does not match a {}x{} plane",
                    img.width, img.height
                ))
            })?;
        let resized = image::imageops::resize(&buffer, width as u32, height as u32, RESAMPLE_FILTER);
        data.extend(resized.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)));
    }

    Ok(SrImage {
        channels: img.channels,
        height,
        width,
        data,
    })
}

/// Shrink an image by `scale` on both axes
pub fn downsample(img: &SrImage, scale: usize) -> Result<SrImage> {
    if scale == 0 {
        return Err(SrError::Config("scale must be at least 1".to_string()));
    }
    let width = img.width / scale;
    let height = img.height / scale;
    if width == 0 || height == 0 {
        return Err(SrError::Image(format!(
            "Image of {}x{} is too small to downsample by {}",
            img.width, img.height, scale
        )));
    }
    interpolate(img, width, height)
}

/// Low-resolution counterpart of an HR image
///
/// When `interpolate_input` is set the shrunk image is brought back to the
/// HR size, which is what SRCNN consumes.
pub fn degrade(img: &SrImage, scale: usize, interpolate_input: bool) -> Result<SrImage> {
    let lr = downsample(img, scale)?;
    if interpolate_input {
        interpolate(&lr, img.width, img.height)
    } else {
        Ok(lr)
    }
}
