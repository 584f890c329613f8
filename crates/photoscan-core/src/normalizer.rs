//! Face normalization: alignment, illumination correction, fixed-size float crop.

use crate::alignment;
use crate::illumination::{self, ClaheSettings};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// Side length of the normalized crop handed to the embedders.
pub const FACE_SIZE: u32 = 160;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("face region lies outside the image")]
    EmptyRegion,
}

/// A normalized square RGB face crop, HWC layout, values in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    size: u32,
    data: Vec<f32>,
}

impl FaceCrop {
    /// Map an 8-bit RGB image into the [-1, 1] range.
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (w, h) = image.dimensions();
        debug_assert_eq!(w, h, "face crops are square");
        let data = image
            .as_raw()
            .iter()
            .map(|&p| (p as f32 / 255.0 - 0.5) * 2.0)
            .collect();
        Self { size: w, data }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Raw HWC values.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at pixel (x, y), channel c.
    pub fn at(&self, x: u32, y: u32, c: usize) -> f32 {
        self.data[(y as usize * self.size as usize + x as usize) * 3 + c]
    }

    /// Value mapped back to the 0..=255 pixel scale.
    pub fn pixel_value(&self, x: u32, y: u32, c: usize) -> f32 {
        (self.at(x, y, c) + 1.0) * 127.5
    }

    /// Horizontally mirrored copy, used for test-time augmentation.
    pub fn mirrored(&self) -> FaceCrop {
        let s = self.size as usize;
        let mut data = vec![0.0f32; self.data.len()];
        for y in 0..s {
            for x in 0..s {
                let src = (y * s + (s - 1 - x)) * 3;
                let dst = (y * s + x) * 3;
                data[dst..dst + 3].copy_from_slice(&self.data[src..src + 3]);
            }
        }
        FaceCrop { size: self.size, data }
    }

    /// Bilinear resample to another square size.
    pub fn resized(&self, size: u32) -> FaceCrop {
        if size == self.size {
            return self.clone();
        }
        let src = self.size as usize;
        let dst = size as usize;
        let inv_scale = src as f32 / dst as f32;
        let mut data = vec![0.0f32; dst * dst * 3];

        for y in 0..dst {
            let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
            let y0 = (src_y.floor().max(0.0) as usize).min(src - 1);
            let y1 = (y0 + 1).min(src - 1);
            let fy = (src_y - y0 as f32).clamp(0.0, 1.0);

            for x in 0..dst {
                let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
                let x0 = (src_x.floor().max(0.0) as usize).min(src - 1);
                let x1 = (x0 + 1).min(src - 1);
                let fx = (src_x - x0 as f32).clamp(0.0, 1.0);

                for c in 0..3 {
                    let at = |xx: usize, yy: usize| self.data[(yy * src + xx) * 3 + c];
                    data[(y * dst + x) * 3 + c] = at(x0, y0) * (1.0 - fx) * (1.0 - fy)
                        + at(x1, y0) * fx * (1.0 - fy)
                        + at(x0, y1) * (1.0 - fx) * fy
                        + at(x1, y1) * fx * fy;
                }
            }
        }

        FaceCrop { size, data }
    }
}

/// Turns one detection in one image into a [`FaceCrop`].
#[derive(Debug, Clone)]
pub struct FaceNormalizer {
    size: u32,
    clahe: ClaheSettings,
}

impl Default for FaceNormalizer {
    fn default() -> Self {
        Self::new(FACE_SIZE, ClaheSettings::default())
    }
}

impl FaceNormalizer {
    pub fn new(size: u32, clahe: ClaheSettings) -> Self {
        Self { size, clahe }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Align (or crop), equalize luminance, rescale and map to [-1, 1].
    pub fn normalize(&self, image: &RgbImage, face: &BoundingBox) -> Result<FaceCrop, NormalizeError> {
        let aligned = match &face.landmarks {
            Some(landmarks) => alignment::align_face(image, landmarks, self.size),
            None => alignment::crop_and_resize(image, face, self.size)
                .ok_or(NormalizeError::EmptyRegion)?,
        };

        let equalized = illumination::equalize_luminance(&aligned, self.clahe);

        let sized = if equalized.dimensions() == (self.size, self.size) {
            equalized
        } else {
            imageops::resize(&equalized, self.size, self.size, FilterType::Triangle)
        };

        Ok(FaceCrop::from_rgb(&sized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn face_box(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_from_rgb_range() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(0, 0, Rgb([0, 255, 128]));
        let crop = FaceCrop::from_rgb(&image);
        assert_eq!(crop.at(0, 0, 0), -1.0);
        assert_eq!(crop.at(0, 0, 1), 1.0);
        assert!(crop.at(0, 0, 2).abs() < 0.01);
        assert!((crop.pixel_value(0, 0, 1) - 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_mirrored_flips_columns() {
        let image = RgbImage::from_fn(4, 4, |x, _| Rgb([(x * 60) as u8, 0, 0]));
        let crop = FaceCrop::from_rgb(&image);
        let flipped = crop.mirrored();
        assert_eq!(flipped.at(0, 1, 0), crop.at(3, 1, 0));
        assert_eq!(flipped.at(3, 2, 0), crop.at(0, 2, 0));
        assert_eq!(flipped.mirrored(), crop);
    }

    #[test]
    fn test_resized_uniform_stays_uniform() {
        let image = RgbImage::from_pixel(160, 160, Rgb([128, 64, 200]));
        let crop = FaceCrop::from_rgb(&image).resized(112);
        assert_eq!(crop.size(), 112);
        let first = crop.at(0, 0, 2);
        assert!(crop.data().chunks(3).all(|px| (px[2] - first).abs() < 1e-5));
    }

    #[test]
    fn test_normalize_without_landmarks() {
        let mut image = RgbImage::from_pixel(200, 100, Rgb([10, 10, 10]));
        for y in 10..90 {
            for x in 50..130 {
                image.put_pixel(x, y, Rgb([180, 120, 90]));
            }
        }
        let crop = FaceNormalizer::default()
            .normalize(&image, &face_box(50.0, 10.0, 80.0, 80.0))
            .unwrap();
        assert_eq!(crop.size(), FACE_SIZE);
        assert_eq!(crop.data().len(), (FACE_SIZE * FACE_SIZE * 3) as usize);
        assert!(crop.data().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let image = RgbImage::from_fn(120, 120, |x, y| Rgb([(x * 2) as u8, (y * 2) as u8, 77]));
        let mut face = face_box(20.0, 20.0, 80.0, 80.0);
        face.landmarks = Some([(45.0, 50.0), (75.0, 50.0), (60.0, 65.0), (48.0, 82.0), (72.0, 82.0)]);
        let normalizer = FaceNormalizer::default();
        let a = normalizer.normalize(&image, &face).unwrap();
        let b = normalizer.normalize(&image, &face).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_rejects_region_outside_image() {
        let image = RgbImage::new(50, 50);
        let result = FaceNormalizer::default().normalize(&image, &face_box(100.0, 100.0, 20.0, 20.0));
        assert!(matches!(result, Err(NormalizeError::EmptyRegion)));
    }
}
