//! Signature table for the deep carver and the per-format structural
//! validators a resolved candidate must pass before it is persisted.

use aho_corasick::AhoCorasick;
use memchr::memmem;

pub const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
pub const PNG_IEND: [u8; 8] = [0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82];
pub const ZIP_LOCAL_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
pub const ZIP_EOCD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

// Bytes of EOCD fixed fields, comment excluded.
pub const ZIP_EOCD_SIZE: usize = 22;

const OFFICE_SNIFF_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarveFormat {
    Jpeg,
    Png,
    Pdf,
    Webp,
    OfficeZip,
}

impl CarveFormat {
    pub fn name(&self) -> &'static str {
        match self {
            CarveFormat::Jpeg => "JPEG Image",
            CarveFormat::Png => "PNG Image",
            CarveFormat::Pdf => "PDF Document",
            CarveFormat::Webp => "WebP Image",
            CarveFormat::OfficeZip => "Office Document",
        }
    }
}

/// How a candidate's end offset is found once its header is known.
#[derive(Debug, Clone, Copy)]
pub enum BoundaryStrategy {
    /// Scan forward for `pattern`; the payload ends `advance` bytes after
    /// the pattern's first byte.
    Trailer {
        pattern: &'static [u8],
        advance: usize,
    },
    /// A little-endian u32 at header + `at` declares the payload length;
    /// the payload ends at header + `base` + that length.
    DeclaredLength { at: usize, base: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct CarveSignature {
    pub format: CarveFormat,
    pub header: &'static [u8],
    pub boundary: BoundaryStrategy,
    pub max_size: u64,
}

impl CarveSignature {
    /// Structural validation of a resolved payload. Returns the extension
    /// the carved file should carry, or `None` to discard the candidate.
    /// Full damage assessment is the scorer's job; this only rejects
    /// byte runs that merely start like the format.
    pub fn validate(&self, data: &[u8]) -> Option<&'static str> {
        match self.format {
            CarveFormat::Jpeg => validate_jpeg(data).then_some("jpg"),
            CarveFormat::Png => validate_png(data).then_some("png"),
            CarveFormat::Pdf => validate_pdf(data).then_some("pdf"),
            CarveFormat::Webp => validate_webp(data).then_some("webp"),
            CarveFormat::OfficeZip => office_flavor(data),
        }
    }
}

pub const SIGNATURES: [CarveSignature; 5] = [
    CarveSignature {
        format: CarveFormat::Jpeg,
        header: &JPEG_SOI,
        boundary: BoundaryStrategy::Trailer {
            pattern: &JPEG_EOI,
            advance: 2,
        },
        max_size: 50 * 1024 * 1024,
    },
    CarveSignature {
        format: CarveFormat::Png,
        header: &PNG_SIGNATURE,
        boundary: BoundaryStrategy::Trailer {
            pattern: &PNG_IEND,
            advance: 8,
        },
        max_size: 60 * 1024 * 1024,
    },
    CarveSignature {
        format: CarveFormat::Pdf,
        header: b"%PDF-",
        boundary: BoundaryStrategy::Trailer {
            pattern: b"%%EOF",
            advance: 5,
        },
        max_size: 32 * 1024 * 1024,
    },
    CarveSignature {
        format: CarveFormat::Webp,
        header: b"RIFF",
        boundary: BoundaryStrategy::DeclaredLength { at: 4, base: 8 },
        max_size: 60 * 1024 * 1024,
    },
    CarveSignature {
        format: CarveFormat::OfficeZip,
        header: &ZIP_LOCAL_HEADER,
        boundary: BoundaryStrategy::Trailer {
            pattern: &ZIP_EOCD,
            advance: ZIP_EOCD_SIZE,
        },
        max_size: 60 * 1024 * 1024,
    },
];

/// Multi-pattern header matcher over the signature table.
#[derive(Debug)]
pub struct SignatureRegistry {
    matcher: Option<AhoCorasick>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        let patterns: Vec<&[u8]> = SIGNATURES.iter().map(|s| s.header).collect();
        Self {
            matcher: AhoCorasick::new(&patterns).ok(),
        }
    }

    /// All header hits in `data`, in ascending offset order.
    pub fn find_headers(&self, data: &[u8]) -> Vec<(usize, &'static CarveSignature)> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };
        matcher
            .find_overlapping_iter(data)
            .map(|mat| (mat.start(), &SIGNATURES[mat.pattern().as_usize()]))
            .collect()
    }
}

impl Default for SignatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn is_valid_marker(marker: u8) -> bool {
    matches!(
        marker,
        0xC0..=0xCF |
        0xD0..=0xD9 |
        0xDA |
        0xDB |
        0xDC..=0xDF |
        0xE0..=0xEF |
        0xFE
    )
}

/// Marker walk up to the scan data. A carved JPEG must yield a frame header
/// with non-zero dimensions before its entropy-coded segment starts.
fn validate_jpeg(data: &[u8]) -> bool {
    if data.len() < 10 || data[0..2] != JPEG_SOI[0..2] || data[2] != 0xFF {
        return false;
    }

    let mut pos = 2;
    let mut has_sof = false;

    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            break;
        }
        let marker = data[pos + 1];

        if marker == 0x00 {
            pos += 2;
            continue;
        }
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        if !is_valid_marker(marker) {
            return false;
        }
        if matches!(marker, 0xD0..=0xD7) {
            pos += 2;
            continue;
        }
        if marker == 0xD9 {
            break;
        }
        if matches!(marker, 0xC0..=0xC3) && pos + 8 < data.len() {
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]);
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]);
            has_sof = width > 0 && height > 0;
        }
        if marker == 0xDA {
            return has_sof;
        }

        if pos + 3 >= data.len() {
            break;
        }
        let seg_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if seg_len < 2 {
            return false;
        }
        pos = pos + 2 + seg_len;
    }

    has_sof
}

fn validate_png(data: &[u8]) -> bool {
    data.starts_with(&PNG_SIGNATURE)
        && memmem::find(&data[..data.len().min(64)], b"IHDR").is_some()
        && memmem::find(data, b"IEND").is_some()
}

fn validate_pdf(data: &[u8]) -> bool {
    let tail_start = data.len().saturating_sub(2048);
    data.starts_with(b"%PDF-") && memmem::find(&data[tail_start..], b"%%EOF").is_some()
}

fn validate_webp(data: &[u8]) -> bool {
    data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP"
}

/// Sniffs the leading entry names of a ZIP container for an Office package
/// layout. Plain ZIPs and unknown packages are discarded.
fn office_flavor(data: &[u8]) -> Option<&'static str> {
    if !data.starts_with(&ZIP_LOCAL_HEADER) {
        return None;
    }
    let snippet = &data[..data.len().min(OFFICE_SNIFF_WINDOW)];
    if memmem::find(snippet, b"word/").is_some() {
        Some("docx")
    } else if memmem::find(snippet, b"xl/").is_some() {
        Some("xlsx")
    } else if memmem::find(snippet, b"ppt/").is_some() {
        Some("pptx")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_jpeg() -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00];
        // SOF0, 17-byte segment, 8x8 pixels
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08, 0x00, 0x08, 0x00, 0x08]);
        data.extend_from_slice(&[0x03, 1, 0x11, 0, 2, 0x11, 1, 3, 0x11, 1]);
        // SOS then scan bytes and EOI
        data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        data.extend_from_slice(&[0x12, 0x34, 0x56, 0xFF, 0xD9]);
        data
    }

    #[test]
    fn registry_finds_every_format_header() {
        let mut data = Vec::new();
        let offsets: Vec<usize> = SIGNATURES
            .iter()
            .map(|sig| {
                let at = data.len();
                data.extend_from_slice(sig.header);
                data.extend_from_slice(&[0u8; 16]);
                at
            })
            .collect();

        let registry = SignatureRegistry::new();
        let hits = registry.find_headers(&data);
        for (expected, sig) in offsets.iter().zip(SIGNATURES.iter()) {
            assert!(hits
                .iter()
                .any(|(pos, hit)| pos == expected && hit.format == sig.format));
        }
    }

    #[test]
    fn jpeg_validator_requires_frame_header() {
        assert!(validate_jpeg(&minimal_jpeg()));

        // header bytes with no SOF segment
        let junk = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, 0x01, 0x02, 0x03];
        assert!(!validate_jpeg(&junk));
    }

    #[test]
    fn office_flavor_assignment() {
        let mut docx = ZIP_LOCAL_HEADER.to_vec();
        docx.extend_from_slice(b"\x00\x00word/document.xml");
        assert_eq!(office_flavor(&docx), Some("docx"));

        let mut xlsx = ZIP_LOCAL_HEADER.to_vec();
        xlsx.extend_from_slice(b"\x00\x00xl/workbook.xml");
        assert_eq!(office_flavor(&xlsx), Some("xlsx"));

        let mut plain = ZIP_LOCAL_HEADER.to_vec();
        plain.extend_from_slice(b"\x00\x00readme.txt");
        assert_eq!(office_flavor(&plain), None);
    }

    #[test]
    fn pdf_validator_needs_trailer_near_end() {
        let good = b"%PDF-1.7\nstuff\n%%EOF";
        assert!(validate_pdf(good));

        let mut bad = b"%PDF-1.7\n%%EOF".to_vec();
        bad.extend_from_slice(&vec![0u8; 4096]);
        assert!(!validate_pdf(&bad));
    }
}
