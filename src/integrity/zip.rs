//! Minimal ZIP container reader used by the office self-check.
//!
//! Resolves members through the central directory and verifies each one's
//! CRC the way an archive tester would. Only the STORED and DEFLATE methods
//! occur in office packages.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::DeflateDecoder;
use memchr::memmem;

const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const CENTRAL_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const LOCAL_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

const EOCD_SIZE: usize = 22;
const CENTRAL_HEADER_SIZE: usize = 46;
const LOCAL_HEADER_SIZE: usize = 30;
const MAX_COMMENT: usize = u16::MAX as usize;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug)]
pub struct ZipSummary {
    /// Member names in central-directory order.
    pub entries: Vec<String>,
    /// First member whose payload fails its checksum, if any.
    pub first_bad: Option<String>,
}

/// Parses the container and checks every member. `None` means the central
/// directory itself does not parse; per-member damage lands in `first_bad`
/// instead.
pub fn check_archive(data: &[u8]) -> Option<ZipSummary> {
    let eocd = find_eocd(data)?;
    let entry_count = LittleEndian::read_u16(&data[eocd + 10..eocd + 12]) as usize;
    let cd_offset = LittleEndian::read_u32(&data[eocd + 16..eocd + 20]) as usize;

    let mut entries = Vec::with_capacity(entry_count.min(1024));
    let mut first_bad = None;
    let mut pos = cd_offset;

    for _ in 0..entry_count {
        if pos + CENTRAL_HEADER_SIZE > data.len()
            || data[pos..pos + 4] != CENTRAL_SIGNATURE
        {
            return None;
        }
        let method = LittleEndian::read_u16(&data[pos + 10..pos + 12]);
        let crc = LittleEndian::read_u32(&data[pos + 16..pos + 20]);
        let compressed_size = LittleEndian::read_u32(&data[pos + 20..pos + 24]) as usize;
        let uncompressed_size = LittleEndian::read_u32(&data[pos + 24..pos + 28]) as usize;
        let name_len = LittleEndian::read_u16(&data[pos + 28..pos + 30]) as usize;
        let extra_len = LittleEndian::read_u16(&data[pos + 30..pos + 32]) as usize;
        let comment_len = LittleEndian::read_u16(&data[pos + 32..pos + 34]) as usize;
        let local_offset = LittleEndian::read_u32(&data[pos + 42..pos + 46]) as usize;

        if method != METHOD_STORED && method != METHOD_DEFLATE {
            return None;
        }
        if pos + CENTRAL_HEADER_SIZE + name_len > data.len() {
            return None;
        }
        let name = String::from_utf8_lossy(
            &data[pos + CENTRAL_HEADER_SIZE..pos + CENTRAL_HEADER_SIZE + name_len],
        )
        .into_owned();

        if first_bad.is_none()
            && !member_checks_out(
                data,
                local_offset,
                method,
                compressed_size,
                uncompressed_size,
                crc,
            )
        {
            first_bad = Some(name.clone());
        }

        entries.push(name);
        pos += CENTRAL_HEADER_SIZE + name_len + extra_len + comment_len;
    }

    Some(ZipSummary { entries, first_bad })
}

/// The end-of-central-directory record sits in the trailing comment window.
/// The last occurrence wins when payload bytes happen to contain the magic.
fn find_eocd(data: &[u8]) -> Option<usize> {
    if data.len() < EOCD_SIZE {
        return None;
    }
    let window_start = data.len().saturating_sub(EOCD_SIZE + MAX_COMMENT);
    let rel = memmem::rfind(&data[window_start..], &EOCD_SIGNATURE)?;
    let pos = window_start + rel;
    (pos + EOCD_SIZE <= data.len()).then_some(pos)
}

fn member_checks_out(
    data: &[u8],
    local_offset: usize,
    method: u16,
    compressed_size: usize,
    uncompressed_size: usize,
    expected_crc: u32,
) -> bool {
    if local_offset + LOCAL_HEADER_SIZE > data.len()
        || data[local_offset..local_offset + 4] != LOCAL_SIGNATURE
    {
        return false;
    }
    // The central directory's sizes and CRC stay valid even when the local
    // header deferred them to a data descriptor.
    let name_len = LittleEndian::read_u16(&data[local_offset + 26..local_offset + 28]) as usize;
    let extra_len = LittleEndian::read_u16(&data[local_offset + 28..local_offset + 30]) as usize;
    let data_start = local_offset + LOCAL_HEADER_SIZE + name_len + extra_len;
    let Some(data_end) = data_start.checked_add(compressed_size) else {
        return false;
    };
    let Some(raw) = data.get(data_start..data_end) else {
        return false;
    };

    let mut hasher = crc32fast::Hasher::new();
    match method {
        METHOD_STORED => hasher.update(raw),
        METHOD_DEFLATE => {
            let mut inflated = Vec::new();
            let decoder = DeflateDecoder::new(raw);
            if decoder
                .take(uncompressed_size as u64 + 1)
                .read_to_end(&mut inflated)
                .is_err()
                || inflated.len() != uncompressed_size
            {
                return false;
            }
            hasher.update(&inflated);
        }
        _ => return false,
    }
    hasher.finalize() == expected_crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn crc32(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    fn u16le(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }

    fn u32le(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    /// Builds a well-formed single-disk archive from (name, raw payload,
    /// method) triples.
    fn build_zip(members: &[(&str, &[u8], u16)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for (name, payload, method) in members {
            let stored;
            let raw: &[u8] = if *method == METHOD_DEFLATE {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(payload).unwrap();
                stored = encoder.finish().unwrap();
                &stored
            } else {
                payload
            };
            let crc = crc32(payload);
            let offset = out.len() as u32;

            out.extend_from_slice(&LOCAL_SIGNATURE);
            out.extend_from_slice(&u16le(20));
            out.extend_from_slice(&u16le(0));
            out.extend_from_slice(&u16le(*method));
            out.extend_from_slice(&u16le(0));
            out.extend_from_slice(&u16le(0));
            out.extend_from_slice(&u32le(crc));
            out.extend_from_slice(&u32le(raw.len() as u32));
            out.extend_from_slice(&u32le(payload.len() as u32));
            out.extend_from_slice(&u16le(name.len() as u16));
            out.extend_from_slice(&u16le(0));
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(raw);

            central.extend_from_slice(&CENTRAL_SIGNATURE);
            central.extend_from_slice(&u16le(20));
            central.extend_from_slice(&u16le(20));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u16le(*method));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u32le(crc));
            central.extend_from_slice(&u32le(raw.len() as u32));
            central.extend_from_slice(&u32le(payload.len() as u32));
            central.extend_from_slice(&u16le(name.len() as u16));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u16le(0));
            central.extend_from_slice(&u32le(0));
            central.extend_from_slice(&u32le(offset));
            central.extend_from_slice(name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(&EOCD_SIGNATURE);
        out.extend_from_slice(&u16le(0));
        out.extend_from_slice(&u16le(0));
        out.extend_from_slice(&u16le(members.len() as u16));
        out.extend_from_slice(&u16le(members.len() as u16));
        out.extend_from_slice(&u32le(central.len() as u32));
        out.extend_from_slice(&u32le(cd_offset));
        out.extend_from_slice(&u16le(0));
        out
    }

    #[test]
    fn clean_archive_passes() {
        let archive = build_zip(&[
            ("[Content_Types].xml", b"<Types/>", METHOD_STORED),
            (
                "word/document.xml",
                b"<w:document>report body</w:document>",
                METHOD_DEFLATE,
            ),
        ]);
        let summary = check_archive(&archive).unwrap();
        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.entries[0], "[Content_Types].xml");
        assert!(summary.first_bad.is_none());
    }

    #[test]
    fn corrupted_member_is_reported() {
        let mut archive = build_zip(&[("_rels/.rels", b"relationship data here", METHOD_STORED)]);
        // flip a payload byte inside the stored member
        let payload_at = LOCAL_HEADER_SIZE + "_rels/.rels".len() + 3;
        archive[payload_at] ^= 0xFF;

        let summary = check_archive(&archive).unwrap();
        assert_eq!(summary.first_bad.as_deref(), Some("_rels/.rels"));
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(check_archive(b"PK\x03\x04 but nothing else").is_none());
        assert!(check_archive(&[]).is_none());
    }

    #[test]
    fn truncated_member_fails_its_check() {
        let mut archive = build_zip(&[("xl/workbook.xml", &[0x42u8; 128], METHOD_STORED)]);
        // point the member past the end of the buffer
        let eocd = find_eocd(&archive).unwrap();
        let cd_offset = LittleEndian::read_u32(&archive[eocd + 16..eocd + 20]) as usize;
        archive[cd_offset + 20..cd_offset + 24].copy_from_slice(&u32le(1 << 24));

        let summary = check_archive(&archive).unwrap();
        assert!(summary.first_bad.is_some());
    }
}
