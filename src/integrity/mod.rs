//! Integrity scorer.
//!
//! Judges how intact a recovered payload is, per format family, on a
//! 0..100 scale. Formats outside the known set are not judged at all.

pub mod image;
pub mod zip;

use memchr::memmem;

use crate::types::IntegrityVerdict;

use image::ImageKind;

const ENTROPY_SAMPLE_THRESHOLD: usize = 5 * 1024 * 1024;
const ENTROPY_SAMPLE_POINTS: usize = 5000;
const PDF_TAIL_WINDOW: usize = 1024;

/// Scores `data` as a payload of the given extension. The verdict is a pure
/// function of the inputs.
pub fn score(extension: &str, data: &[u8]) -> IntegrityVerdict {
    if data.is_empty() || extension.is_empty() {
        return IntegrityVerdict::Unsupported;
    }
    match extension.to_ascii_lowercase().as_str() {
        "png" => IntegrityVerdict::Score(image::score(data, ImageKind::Png)),
        "jpg" | "jpeg" => IntegrityVerdict::Score(image::score(data, ImageKind::Jpeg)),
        "webp" => IntegrityVerdict::Score(image::score(data, ImageKind::Webp)),
        "docx" | "xlsx" | "pptx" | "odt" | "ods" | "odp" => {
            IntegrityVerdict::Score(office_score(data))
        }
        "pdf" => IntegrityVerdict::Score(pdf_score(data)),
        _ => IntegrityVerdict::Unsupported,
    }
}

/// Shannon entropy (bits per byte) and the percentage of zero bytes.
/// Entropy is taken over a stride subsample once the buffer passes 5 MiB;
/// the zero ratio always covers the whole buffer.
pub fn entropy_and_zeros(data: &[u8]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }

    let zero_count = memchr::memchr_iter(0, data).count();
    let zero_ratio = zero_count as f64 / data.len() as f64 * 100.0;

    let mut freq = [0u64; 256];
    let mut total = 0u64;
    if data.len() > ENTROPY_SAMPLE_THRESHOLD {
        let step = data.len() / ENTROPY_SAMPLE_POINTS;
        let mut i = 0;
        while i < data.len() {
            freq[data[i] as usize] += 1;
            total += 1;
            i += step;
        }
    } else {
        for &byte in data {
            freq[byte as usize] += 1;
        }
        total = data.len() as u64;
    }

    let mut entropy = 0.0f64;
    for &count in freq.iter().filter(|&&c| c > 0) {
        let p = count as f64 / total as f64;
        entropy -= p * p.log2();
    }
    (entropy, zero_ratio)
}

/// Office packages are ZIP containers; the score reflects how much of the
/// container machinery survives. Bad member checksums land on 50, a ZIP
/// without package markers on 20.
fn office_score(data: &[u8]) -> f64 {
    if !data.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        return 0.0;
    }
    let Some(summary) = zip::check_archive(data) else {
        return 0.0;
    };
    if summary.first_bad.is_some() {
        return 50.0;
    }
    if summary.entries.is_empty() {
        return 0.0;
    }
    let has_package_marker = summary
        .entries
        .iter()
        .any(|name| name == "[Content_Types].xml" || name == "_rels/.rels");
    if !has_package_marker {
        return 20.0;
    }
    100.0
}

fn pdf_score(data: &[u8]) -> f64 {
    if !data.starts_with(b"%PDF-") {
        return 0.0;
    }
    let tail_start = data.len().saturating_sub(PDF_TAIL_WINDOW);
    let has_eof = memmem::find(&data[tail_start..], b"%%EOF").is_some();
    let (entropy, zero_ratio) = entropy_and_zeros(data);

    let mut score = 100.0;
    if !has_eof {
        score -= 20.0;
    }
    if zero_ratio > 10.0 {
        score -= zero_ratio;
    }
    if entropy < 4.0 {
        score = 0.0;
    }
    score.max(0.0)
}
