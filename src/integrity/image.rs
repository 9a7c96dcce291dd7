//! Structural and visual damage assessment for image payloads.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memchr::memmem;

use super::entropy_and_zeros;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

// Chunk overhead besides the data: length + type + CRC.
const PNG_CHUNK_OVERHEAD: usize = 12;
const PNG_TAIL_WINDOW: usize = 20;
const MISSING_TAIL_PENALTY: u64 = 1024;

// Bands with a mean per-channel variance under this are flat enough to be
// wiped or fill-pattern rows rather than picture content.
const FLAT_BAND_VARIANCE: f64 = 2.0;
const VISUAL_BANDS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Webp,
}

/// Combined integrity score for an image payload. Damage is the worse of
/// the structural and visual assessments; near-clean pixels forgive small
/// structural dents, and sub-1.0 entropy overrides everything as wiped.
pub fn score(data: &[u8], kind: ImageKind) -> f64 {
    let visual = visual_damage(data);
    let structural = structural_damage(data, kind);

    let mut damage = visual.max(structural);
    if visual < 1.0 && structural > 0.0 && structural < 20.0 {
        damage = damage.min(5.0);
    }

    let (entropy, _) = entropy_and_zeros(data);
    if entropy < 1.0 {
        damage = 100.0;
    }
    100.0 - damage
}

/// Percentage of the payload that container-level bookkeeping marks as
/// damaged. 100 means the payload does not even open as the format.
pub fn structural_damage(data: &[u8], kind: ImageKind) -> f64 {
    let file_size = data.len();
    let mut corrupted_bytes = 0u64;
    let mut missing_tail = false;

    match kind {
        ImageKind::Png => {
            if !data.starts_with(&PNG_SIGNATURE) {
                return 100.0;
            }
            let mut pos = PNG_SIGNATURE.len();
            while pos + 8 <= data.len() {
                let length = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
                if length > file_size {
                    corrupted_bytes += (file_size - pos) as u64;
                    break;
                }
                pos += length + PNG_CHUNK_OVERHEAD;
            }
            let tail_start = data.len().saturating_sub(PNG_TAIL_WINDOW);
            if memmem::find(&data[tail_start..], b"IEND").is_none() {
                missing_tail = true;
            }
        }
        ImageKind::Jpeg => {
            if !data.starts_with(&JPEG_SOI) {
                return 100.0;
            }
            let trimmed_end = data.len() - data.iter().rev().take_while(|&&b| b == 0).count();
            if !data[..trimmed_end].ends_with(&JPEG_EOI) {
                missing_tail = true;
            }
        }
        ImageKind::Webp => {
            if data.len() < 12 || !data.starts_with(b"RIFF") || &data[8..12] != b"WEBP" {
                return 100.0;
            }
            let riff_len = LittleEndian::read_u32(&data[4..8]) as u64;
            if riff_len + 8 > file_size as u64 {
                missing_tail = true;
                corrupted_bytes = riff_len + 8 - file_size as u64;
            }
        }
    }

    let mut raw_damage = corrupted_bytes;
    if missing_tail {
        raw_damage += MISSING_TAIL_PENALTY;
    }
    if file_size == 0 {
        return 0.0;
    }
    (raw_damage as f64 / file_size as f64 * 100.0).min(100.0)
}

/// Percentage of image height that decodes to flat bands at the bottom
/// edge, where truncated picture data lands. An undecodable payload counts
/// as fully damaged.
pub fn visual_damage(data: &[u8]) -> f64 {
    let Ok(decoded) = image::load_from_memory(data) else {
        return 100.0;
    };
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return 100.0;
    }

    let step = (height / VISUAL_BANDS).max(1);
    let mut corrupted_rows = 0u64;

    let mut y = height as i64 - step as i64;
    while y > 0 {
        if band_variance(&rgb, y as u32, step) < FLAT_BAND_VARIANCE {
            corrupted_rows += step as u64;
        } else {
            break;
        }
        y -= step as i64;
    }

    (corrupted_rows as f64 / height as f64 * 100.0).min(100.0)
}

/// Mean of the three per-channel pixel variances over rows `y..y + rows`.
fn band_variance(rgb: &image::RgbImage, y: u32, rows: u32) -> f64 {
    let (width, _) = rgb.dimensions();
    let mut sum = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];
    let count = (width as u64 * rows as u64) as f64;

    for row in y..y + rows {
        for x in 0..width {
            let pixel = rgb.get_pixel(x, row);
            for channel in 0..3 {
                let value = pixel.0[channel] as f64;
                sum[channel] += value;
                sum_sq[channel] += value * value;
            }
        }
    }

    let mut total = 0.0;
    for channel in 0..3 {
        let mean = sum[channel] / count;
        total += sum_sq[channel] / count - mean * mean;
    }
    total / 3.0
}
