//! Illumination correction: CLAHE on the luma channel of YCbCr.
//!
//! Only luminance is equalized; Cb/Cr pass through untouched so skin tone
//! information reaching the embedders is unchanged.

use image::{Rgb, RgbImage};

/// CLAHE parameters.
#[derive(Debug, Clone, Copy)]
pub struct ClaheSettings {
    /// Tiles per side (square grid).
    pub tiles: u32,
    /// Histogram clip limit, relative to a flat histogram (OpenCV semantics).
    pub clip_limit: f32,
}

impl Default for ClaheSettings {
    fn default() -> Self {
        Self {
            tiles: 8,
            clip_limit: 2.0,
        }
    }
}

/// Apply CLAHE to an 8-bit luma plane in place.
///
/// The plane is split into `tiles`×`tiles` regions, each gets a clipped
/// histogram-equalization lookup table, and every pixel blends the tables of
/// its four nearest tile centres. Planes smaller than the grid are left as is.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, settings: ClaheSettings) {
    let (w, h, n) = (width as usize, height as usize, settings.tiles as usize);
    if n == 0 || gray.len() < w * h || w < n || h < n {
        return;
    }
    let (tile_w, tile_h) = (w / n, h / n);
    let clip = ((settings.clip_limit * (tile_w * tile_h) as f32 / 256.0) as u32).max(1);

    let luts: Vec<[f32; 256]> = (0..n * n)
        .map(|t| {
            let (x0, y0) = ((t % n) * tile_w, (t / n) * tile_h);
            let mut hist = [0u32; 256];
            for row in gray[y0 * w..(y0 + tile_h) * w].chunks_exact(w) {
                for &v in &row[x0..x0 + tile_w] {
                    hist[v as usize] += 1;
                }
            }
            equalization_lut(hist, clip, (tile_w * tile_h) as u32)
        })
        .collect();

    let last = (n - 1) as f32;
    for y in 0..h {
        let gy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let (r0, fy) = (gy as usize, gy.fract());
        let r1 = (r0 + 1).min(n - 1);
        for x in 0..w {
            let gx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let (c0, fx) = (gx as usize, gx.fract());
            let c1 = (c0 + 1).min(n - 1);

            let v = gray[y * w + x] as usize;
            let lerp = |l: f32, r: f32, f: f32| l + (r - l) * f;
            let top = lerp(luts[r0 * n + c0][v], luts[r0 * n + c1][v], fx);
            let bottom = lerp(luts[r1 * n + c0][v], luts[r1 * n + c1][v], fx);
            gray[y * w + x] = lerp(top, bottom, fy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clip `hist` at `clip`, spread the excess evenly, and turn the cumulative
/// counts into a 0..=255 mapping. A single-valued tile maps to itself.
fn equalization_lut(mut hist: [u32; 256], clip: u32, pixels: u32) -> [f32; 256] {
    let excess: u32 = hist
        .iter_mut()
        .map(|bin| {
            let over = bin.saturating_sub(clip);
            *bin -= over;
            over
        })
        .sum();
    let (share, remainder) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0u32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        running += count;
        *slot = running as f32;
    }

    let floor = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let span = pixels as f32 - floor;
    if span <= 0.0 {
        return std::array::from_fn(|i| i as f32);
    }
    cdf.map(|v| ((v - floor) / span * 255.0).clamp(0.0, 255.0))
}

/// Equalize the luminance of an RGB image, leaving chroma untouched.
pub fn equalize_luminance(image: &RgbImage, settings: ClaheSettings) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut luma = Vec::with_capacity((width * height) as usize);
    let mut chroma = Vec::with_capacity((width * height) as usize);

    for px in image.pixels() {
        let (y, cb, cr) = rgb_to_ycbcr(px);
        luma.push(y.round().clamp(0.0, 255.0) as u8);
        chroma.push((cb, cr));
    }

    clahe_enhance(&mut luma, width, height, settings);

    let mut out = RgbImage::new(width, height);
    for ((px, &y), &(cb, cr)) in out.pixels_mut().zip(luma.iter()).zip(chroma.iter()) {
        *px = ycbcr_to_rgb(y as f32, cb, cr);
    }
    out
}

/// Full-range BT.601 RGB → YCbCr.
fn rgb_to_ycbcr(px: &Rgb<u8>) -> (f32, f32, f32) {
    let [r, g, b] = px.0.map(f32::from);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (y, cb, cr)
}

fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> Rgb<u8> {
    let r = y + 1.402 * (cr - 128.0);
    let g = y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0);
    let b = y + 1.772 * (cb - 128.0);
    Rgb([r, g, b].map(|v| v.round().clamp(0.0, 255.0) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        variance.sqrt()
    }

    #[test]
    fn test_clahe_increases_contrast() {
        // Low-contrast 16x16 image: all pixels between 100 and 110
        let (w, h) = (16u32, 16u32);
        let mut gray: Vec<u8> = (0..(w * h) as usize)
            .map(|i| 100 + (i % 11) as u8)
            .collect();

        let orig_stddev = stddev(&gray);
        clahe_enhance(&mut gray, w, h, ClaheSettings { tiles: 2, clip_limit: 4.0 });
        let new_stddev = stddev(&gray);

        assert!(
            new_stddev > orig_stddev,
            "CLAHE should increase contrast: orig={orig_stddev:.2}, new={new_stddev:.2}"
        );
    }

    #[test]
    fn test_clahe_tiny_image_is_noop() {
        let mut gray = vec![10u8, 20, 30, 40];
        clahe_enhance(&mut gray, 2, 2, ClaheSettings::default());
        assert_eq!(gray, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_lut_is_monotonic_and_clipped() {
        let mut hist = [0u32; 256];
        hist[100] = 400;
        let lut = equalization_lut(hist, 3, 400);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lut[255], 255.0);
        // The spike is clipped, so the tile does not jump to white.
        assert!(lut[100] < 200.0, "lut[100] = {}", lut[100]);
    }

    #[test]
    fn test_ycbcr_roundtrip() {
        for px in [Rgb([0, 0, 0]), Rgb([255, 255, 255]), Rgb([200, 30, 90]), Rgb([12, 240, 77])] {
            let (y, cb, cr) = rgb_to_ycbcr(&px);
            let back = ycbcr_to_rgb(y, cb, cr);
            for c in 0..3 {
                assert!((back[c] as i32 - px[c] as i32).abs() <= 1, "{px:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn test_equalize_preserves_chroma() {
        // Left half dark red, right half brighter red: luma changes, hue stays.
        let mut image = RgbImage::new(32, 32);
        for (x, _, px) in image.enumerate_pixels_mut() {
            *px = if x < 16 { Rgb([90, 20, 20]) } else { Rgb([140, 40, 40]) };
        }

        let out = equalize_luminance(&image, ClaheSettings { tiles: 2, clip_limit: 2.0 });
        assert_eq!(out.dimensions(), (32, 32));

        let (_, cb_in, cr_in) = rgb_to_ycbcr(image.get_pixel(2, 2));
        let (_, cb_out, cr_out) = rgb_to_ycbcr(out.get_pixel(2, 2));
        assert!((cb_in - cb_out).abs() < 3.0, "cb {cb_in} -> {cb_out}");
        assert!((cr_in - cr_out).abs() < 3.0, "cr {cr_in} -> {cr_out}");
    }

    #[test]
    fn test_equalize_is_deterministic() {
        let image = RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 5) as u8, (y * 3) as u8, 90]));
        let a = equalize_luminance(&image, ClaheSettings::default());
        let b = equalize_luminance(&image, ClaheSettings::default());
        assert_eq!(a, b);
    }
}
