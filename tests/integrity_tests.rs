//! Scorer behavior over real encoded payloads and hand-built containers.

use flate2::write::DeflateEncoder;
use flate2::Compression;
use lazarus::integrity::score;
use lazarus::IntegrityVerdict;
use std::io::Write;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

fn deflate(payload: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

fn build_zip(members: &[(&str, &[u8], u16)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();

    for (name, payload, method) in members {
        let raw = if *method == METHOD_DEFLATE {
            deflate(payload)
        } else {
            payload.to_vec()
        };
        let crc = crc32fast::hash(payload);
        let local_offset = out.len() as u32;

        out.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&raw);

        central.push((*name, crc, raw.len() as u32, payload.len() as u32, local_offset, *method));
    }

    let cd_offset = out.len() as u32;
    for (name, crc, compressed, uncompressed, local_offset, method) in &central {
        out.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02]);
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&compressed.to_le_bytes());
        out.extend_from_slice(&uncompressed.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&local_offset.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    let cd_size = out.len() as u32 - cd_offset;

    out.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(central.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u16).to_le_bytes());
    out.extend_from_slice(&cd_size.to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn encode(format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_fn(16, 16, |x, y| {
        image::Rgb([(x * 16) as u8, (y * 16) as u8, ((x + y) * 8) as u8])
    });
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

#[test]
fn test_clean_encodes_score_perfect() {
    assert_eq!(
        score("png", &encode(image::ImageFormat::Png)),
        IntegrityVerdict::Score(100.0)
    );
    assert_eq!(
        score("jpg", &encode(image::ImageFormat::Jpeg)),
        IntegrityVerdict::Score(100.0)
    );
    assert_eq!(
        score("webp", &encode(image::ImageFormat::WebP)),
        IntegrityVerdict::Score(100.0)
    );
}

#[test]
fn test_truncated_images_are_penalized() {
    let png = encode(image::ImageFormat::Png);
    let cut = &png[..png.len() - 30];
    assert!(matches!(score("png", cut), IntegrityVerdict::Score(s) if s < 50.0));

    let jpeg = encode(image::ImageFormat::Jpeg);
    let half = &jpeg[..jpeg.len() / 2];
    assert_eq!(score("jpg", half), IntegrityVerdict::Score(0.0));

    let webp = encode(image::ImageFormat::WebP);
    let torn = &webp[..webp.len() - 20];
    assert_eq!(score("webp", torn), IntegrityVerdict::Score(0.0));
}

#[test]
fn test_office_package_ladder() {
    let full = build_zip(&[
        ("[Content_Types].xml", b"<Types/>".as_slice(), METHOD_DEFLATE),
        ("word/document.xml", b"<w:document/>".as_slice(), METHOD_STORED),
    ]);
    assert_eq!(score("docx", &full), IntegrityVerdict::Score(100.0));

    // one flipped payload byte fails that member's checksum
    let mut damaged = full.clone();
    let at = damaged
        .windows(13)
        .position(|w| w == b"<w:document/>")
        .unwrap();
    damaged[at] ^= 0xFF;
    assert_eq!(score("docx", &damaged), IntegrityVerdict::Score(50.0));

    // a real ZIP that is not an office package
    let plain = build_zip(&[("notes.txt", b"just some notes".as_slice(), METHOD_STORED)]);
    assert_eq!(score("docx", &plain), IntegrityVerdict::Score(20.0));

    assert_eq!(score("docx", b"not a zip at all"), IntegrityVerdict::Score(0.0));
}

#[test]
fn test_opendocument_extensions_share_the_office_scorer() {
    let package = build_zip(&[
        ("_rels/.rels", b"<Relationships/>".as_slice(), METHOD_DEFLATE),
        ("content.xml", b"<office:document/>".as_slice(), METHOD_STORED),
    ]);
    assert_eq!(score("odt", &package), IntegrityVerdict::Score(100.0));
    assert_eq!(score("ods", &package), IntegrityVerdict::Score(100.0));
    assert_eq!(score("odp", &package), IntegrityVerdict::Score(100.0));
}

#[test]
fn test_pdf_trailer_rules() {
    let mut pdf = b"%PDF-1.7\n".to_vec();
    pdf.extend((0..2048).map(|i| (i * 37 % 251) as u8));
    let mut whole = pdf.clone();
    whole.extend_from_slice(b"\n%%EOF");

    assert_eq!(score("pdf", &whole), IntegrityVerdict::Score(100.0));
    assert_eq!(score("pdf", &pdf), IntegrityVerdict::Score(80.0));
}

#[test]
fn test_extension_routing() {
    // case-insensitive, unknown formats left alone
    let jpeg = encode(image::ImageFormat::Jpeg);
    assert_eq!(score("JPG", &jpeg), IntegrityVerdict::Score(100.0));
    assert_eq!(score("txt", b"hello"), IntegrityVerdict::Unsupported);
    assert_eq!(score("", b"hello"), IntegrityVerdict::Unsupported);
    assert_eq!(score("png", b""), IntegrityVerdict::Unsupported);
}
