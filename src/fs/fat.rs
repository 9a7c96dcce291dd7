//! FAT32 metadata walker.
//!
//! Walks the directory tree of a FAT32 volume looking for deleted entries
//! and judges their recoverability against the FAT allocation table.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::io::Cursor;

use crate::error::{Result, ScanError};
use crate::io::BlockReader;
use crate::scan::ScanContext;
use crate::types::{extension_of, format_timestamp, RecoverabilityStatus, RecoveredFileRecord};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const DIR_ENTRY_SIZE: usize = 32;

const ATTR_LFN: u8 = 0x0F;
const ATTR_DIRECTORY: u8 = 0x10;
const DELETED_MARKER: u8 = 0xE5;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
const FAT_END_OF_CHAIN: u32 = 0x0FFF_FFF8;

// Bounds for hostile or trashed metadata. The visited set already stops
// cycles; these cap linear runaway chains and stack depth.
const MAX_DIRECTORY_CLUSTERS: usize = 65_536;
const MAX_DIRECTORY_DEPTH: usize = 256;

/// BIOS parameter block fields of a FAT32 volume plus the derived layout.
#[derive(Debug, Clone)]
pub struct FatGeometry {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
}

impl FatGeometry {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(ScanError::CorruptMetadata(
                "boot sector shorter than 512 bytes".to_string(),
            ));
        }
        if data[510..512] != [0x55, 0xAA] {
            return Err(ScanError::InvalidSignature(
                "missing 0x55AA boot sector trailer".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(11);
        let bytes_per_sector = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;
        let sectors_per_cluster = cursor
            .read_u8()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;
        let reserved_sectors = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;
        let fat_count = cursor
            .read_u8()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        cursor.set_position(36);
        let sectors_per_fat = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        cursor.set_position(44);
        let root_cluster = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(ScanError::CorruptMetadata(
                "zero bytes-per-sector or sectors-per-cluster".to_string(),
            ));
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            sectors_per_fat,
            root_cluster,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn fat_start_sector(&self) -> u64 {
        self.reserved_sectors as u64
    }

    pub fn data_start_sector(&self) -> u64 {
        self.fat_start_sector() + self.fat_count as u64 * self.sectors_per_fat as u64
    }

    pub fn first_sector_of_cluster(&self, cluster: u32) -> u64 {
        self.data_start_sector() + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Absolute byte offset of the first byte of `cluster`.
    pub fn cluster_to_offset(&self, cluster: u32) -> u64 {
        self.first_sector_of_cluster(cluster) * self.bytes_per_sector as u64
    }

    fn fat_entry_offset(&self, cluster: u64) -> u64 {
        self.fat_start_sector() * self.bytes_per_sector as u64 + cluster * 4
    }
}

/// One decoded 32-byte directory slot, with any preceding long-name parts
/// already folded into `name`.
#[derive(Debug, Clone)]
pub struct FatDirEntry {
    pub name: String,
    pub extension: String,
    pub cluster: u32,
    pub size: u32,
    pub deleted: bool,
    pub attributes: u8,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub accessed: Option<NaiveDateTime>,
}

impl FatDirEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

fn u16_at(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn u32_at(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

/// Converts a packed FAT date/time pair. `tenths` is the creation-time
/// tenth-of-second byte, 10ms units. All-zero input means "no timestamp".
pub fn fat_datetime(date: u16, time: u16, tenths: u8) -> Option<NaiveDateTime> {
    if date == 0 && time == 0 && tenths == 0 {
        return None;
    }
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) as u32) * 2;

    let dt = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Some(dt + Duration::milliseconds(tenths as i64 * 10))
}

fn decode_short_field(field: &[u8]) -> String {
    let s: String = field
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect();
    s.trim().to_string()
}

fn decode_lfn_part(slot: &[u8]) -> String {
    let mut raw = Vec::with_capacity(26);
    raw.extend_from_slice(&slot[1..11]);
    raw.extend_from_slice(&slot[14..26]);
    raw.extend_from_slice(&slot[28..32]);

    let units: Vec<u16> = raw.chunks_exact(2).map(|c| u16_at(c, 0)).collect();
    String::from_utf16_lossy(&units)
}

/// Decodes a directory's raw bytes into entries.
///
/// Long-name parts arrive in reverse order ahead of their short entry and
/// are accumulated newest-first; the name is cut at the first NUL. Deleted
/// entries keep their long names (the 0xE5 marker only overwrites the
/// sequence byte) and fall back to `?NAME.EXT` without one.
pub fn parse_directory_entries(data: &[u8]) -> Vec<FatDirEntry> {
    let mut entries = Vec::new();
    let mut lfn_parts: Vec<String> = Vec::new();

    for slot in data.chunks_exact(DIR_ENTRY_SIZE) {
        if slot[0] == 0x00 {
            break;
        }
        let attributes = slot[11];
        if attributes == ATTR_LFN {
            lfn_parts.insert(0, decode_lfn_part(slot));
            continue;
        }

        let deleted = slot[0] == DELETED_MARKER;
        let short_name = decode_short_field(&slot[0..8]);
        let short_ext = decode_short_field(&slot[8..11]);

        let name = if lfn_parts.is_empty() {
            let base = if deleted {
                let rest: String = short_name.chars().skip(1).collect();
                format!("?{rest}")
            } else {
                short_name
            };
            if short_ext.is_empty() {
                base
            } else {
                format!("{base}.{short_ext}")
            }
        } else {
            let joined: String = std::mem::take(&mut lfn_parts).concat();
            joined.split('\0').next().unwrap_or_default().to_string()
        };

        if name == "." || name == ".." {
            continue;
        }

        let cluster = ((u16_at(slot, 20) as u32) << 16) | u16_at(slot, 26) as u32;
        let extension = if name.contains('.') {
            extension_of(&name)
        } else {
            short_ext.to_ascii_lowercase()
        };

        entries.push(FatDirEntry {
            name,
            extension,
            cluster,
            size: u32_at(slot, 28),
            deleted,
            attributes,
            created: fat_datetime(u16_at(slot, 16), u16_at(slot, 14), slot[13]),
            modified: fat_datetime(u16_at(slot, 24), u16_at(slot, 22), 0),
            accessed: fat_datetime(u16_at(slot, 18), 0, 0),
        });
    }
    entries
}

/// A parsed FAT32 volume ready to walk.
pub struct FatVolume {
    pub geometry: FatGeometry,
}

impl FatVolume {
    pub fn open<R: BlockReader>(ctx: &mut ScanContext<'_, R>) -> Result<Self> {
        let boot = ctx.read_exact_at(0, BOOT_SECTOR_SIZE)?;
        let geometry = FatGeometry::parse(&boot)?;
        tracing::info!(
            cluster_size = geometry.cluster_size(),
            root = geometry.root_cluster,
            "FAT32 volume opened"
        );
        Ok(Self { geometry })
    }

    /// FAT entry for `cluster`, masked to 28 bits. Clusters below 2 have no
    /// table slot and read as end-of-chain. A read failure yields `None` and
    /// the caller degrades to Unknown.
    fn fat_entry<R: BlockReader>(&self, ctx: &mut ScanContext<'_, R>, cluster: u64) -> Option<u32> {
        if cluster < 2 {
            return Some(0xFFFF_FFFF);
        }
        match ctx.read_exact_at(self.geometry.fat_entry_offset(cluster), 4) {
            Ok(bytes) => Some(u32_at(&bytes, 0) & FAT_ENTRY_MASK),
            Err(_) => None,
        }
    }

    /// Gathers a directory's bytes by following its cluster chain. Chain
    /// anomalies stop the walk but keep what was already read.
    fn read_directory<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
        first_cluster: u32,
        visited: &mut HashSet<u32>,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        let mut cluster = first_cluster;

        for _ in 0..MAX_DIRECTORY_CLUSTERS {
            if cluster < 2 {
                break;
            }
            if !visited.insert(cluster) {
                ctx.note_cycle(cluster as u64);
                break;
            }
            let offset = self.geometry.cluster_to_offset(cluster);
            match ctx.read_at(offset, self.geometry.cluster_size() as usize) {
                Ok(chunk) if !chunk.is_empty() => data.extend_from_slice(&chunk),
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(cluster, error = %e, "directory cluster unreadable");
                    break;
                }
            }
            match self.fat_entry(ctx, cluster as u64) {
                Some(next) if next >= 2 && next < FAT_END_OF_CHAIN => cluster = next,
                _ => break,
            }
        }
        data
    }

    /// Recoverability of a deleted file against the FAT.
    ///
    /// Deleted chains cannot be followed (their FAT entries are zeroed), so
    /// this probes the clusters a contiguous allocation from `start_cluster`
    /// would have used.
    pub fn file_status<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
        start_cluster: u32,
        size: u64,
    ) -> RecoverabilityStatus {
        let needed = size.div_ceil(self.geometry.cluster_size());
        if needed == 0 {
            return RecoverabilityStatus::Recoverable;
        }
        let mut free = 0u64;
        for i in 0..needed {
            match self.fat_entry(ctx, start_cluster as u64 + i) {
                None => return RecoverabilityStatus::Unknown,
                Some(0) => free += 1,
                Some(_) => {}
            }
        }
        if free == needed {
            RecoverabilityStatus::Recoverable
        } else if free == 0 {
            RecoverabilityStatus::Overwritten
        } else {
            RecoverabilityStatus::PartiallyRecoverable
        }
    }

    fn count_entries<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
        cluster: u32,
        depth: usize,
        visited: &mut HashSet<u32>,
    ) -> usize {
        if depth > MAX_DIRECTORY_DEPTH {
            tracing::warn!(cluster, "directory tree deeper than supported, pruning");
            return 0;
        }
        let data = self.read_directory(ctx, cluster, visited);
        let entries = parse_directory_entries(&data);
        let mut total = entries.len();
        for e in &entries {
            if ctx.cancelled() {
                break;
            }
            if e.is_directory() && !e.deleted && e.cluster > 1 {
                total += self.count_entries(ctx, e.cluster, depth + 1, visited);
            }
        }
        total
    }

    fn scan_directory<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
        cluster: u32,
        path: &str,
        depth: usize,
        visited: &mut HashSet<u32>,
        done: &mut usize,
        total: usize,
    ) -> Result<()> {
        if depth > MAX_DIRECTORY_DEPTH {
            return Ok(());
        }
        let data = self.read_directory(ctx, cluster, visited);
        let entries = parse_directory_entries(&data);

        for e in entries {
            if ctx.cancelled() {
                return Ok(());
            }
            *done += 1;
            if total > 0 {
                ctx.progress((*done * 100 / total).min(100) as u8);
            }

            let full_path = if path.is_empty() {
                e.name.clone()
            } else {
                format!("{path}/{}", e.name)
            };
            let offset = if e.cluster >= 2 {
                self.geometry.cluster_to_offset(e.cluster)
            } else {
                0
            };

            if e.deleted && e.cluster > 1 {
                let status = self.file_status(ctx, e.cluster, e.size as u64);
                ctx.emit(RecoveredFileRecord {
                    name: e.name.clone(),
                    extension: e.extension.clone(),
                    size: e.size as u64,
                    created: format_timestamp(e.created),
                    modified: format_timestamp(e.modified),
                    accessed: format_timestamp(e.accessed),
                    path: full_path.clone(),
                    offset,
                    start_unit: Some(e.cluster as u64),
                    status,
                    integrity: crate::types::IntegrityVerdict::NotEvaluated,
                });
            }

            if e.is_directory() && !e.deleted && e.cluster > 1 {
                self.scan_directory(ctx, e.cluster, &full_path, depth + 1, visited, done, total)?;
            }
        }
        Ok(())
    }
}

/// Full deleted-file scan of a FAT32 volume: a counting pass sizes the work,
/// then the walk reports entry-level progress and emits one record per
/// deleted entry that still points at a cluster.
pub fn scan_volume<R: BlockReader>(ctx: &mut ScanContext<'_, R>) -> Result<()> {
    let volume = FatVolume::open(ctx)?;
    let root = volume.geometry.root_cluster;

    let mut count_visited = HashSet::new();
    let total = volume.count_entries(ctx, root, 0, &mut count_visited);
    tracing::info!(total, "counted directory entries");

    if ctx.cancelled() {
        return Ok(());
    }

    let mut visited = HashSet::new();
    let mut done = 0usize;
    volume.scan_directory(ctx, root, "", 0, &mut visited, &mut done, total.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector(bps: u16, spc: u8, reserved: u16, nfats: u8, spf: u32, root: u32) -> Vec<u8> {
        let mut boot = vec![0u8; 512];
        boot[11..13].copy_from_slice(&bps.to_le_bytes());
        boot[13] = spc;
        boot[14..16].copy_from_slice(&reserved.to_le_bytes());
        boot[16] = nfats;
        boot[36..40].copy_from_slice(&spf.to_le_bytes());
        boot[44..48].copy_from_slice(&root.to_le_bytes());
        boot[510] = 0x55;
        boot[511] = 0xAA;
        boot
    }

    #[test]
    fn geometry_parse_and_layout() {
        let geo = FatGeometry::parse(&boot_sector(512, 1, 32, 2, 16, 2)).unwrap();
        assert_eq!(geo.cluster_size(), 512);
        assert_eq!(geo.data_start_sector(), 32 + 2 * 16);
        // cluster 2 is the first data cluster
        assert_eq!(geo.cluster_to_offset(2), geo.data_start_sector() * 512);
    }

    #[test]
    fn geometry_rejects_missing_trailer() {
        let mut boot = boot_sector(512, 1, 32, 2, 16, 2);
        boot[510] = 0;
        assert!(matches!(
            FatGeometry::parse(&boot),
            Err(ScanError::InvalidSignature(_))
        ));
    }

    #[test]
    fn geometry_rejects_zero_fields() {
        let boot = boot_sector(0, 1, 32, 2, 16, 2);
        assert!(matches!(
            FatGeometry::parse(&boot),
            Err(ScanError::CorruptMetadata(_))
        ));
    }

    #[test]
    fn packed_datetime_decoding() {
        // 2023-05-17, 14:32:10
        let date = ((2023 - 1980) << 9) | (5 << 5) | 17;
        let time = (14 << 11) | (32 << 5) | (10 / 2);
        let dt = fat_datetime(date, time, 0).unwrap();
        assert_eq!(format_timestamp(Some(dt)), "17/05/2023 14:32:10");
        assert!(fat_datetime(0, 0, 0).is_none());
        // month 15 cannot exist
        assert!(fat_datetime(15 << 5, 0, 0).is_none());
    }

    fn short_entry(name: &[u8; 11], attr: u8, cluster: u32, size: u32, deleted: bool) -> Vec<u8> {
        let mut slot = vec![0u8; 32];
        slot[..11].copy_from_slice(name);
        if deleted {
            slot[0] = 0xE5;
        }
        slot[11] = attr;
        slot[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        slot[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        slot[28..32].copy_from_slice(&size.to_le_bytes());
        slot
    }

    #[test]
    fn deleted_short_name_gets_question_mark() {
        let data = short_entry(b"HOTO  JPG  ", 0x20, 5, 1000, true);
        // the raw name bytes are PHOTO/JPG with the first byte overwritten
        let mut data = data;
        data[1..8].copy_from_slice(b"HOTO   ");
        data[8..11].copy_from_slice(b"JPG");
        let entries = parse_directory_entries(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "?HOTO.JPG");
        assert_eq!(entries[0].extension, "jpg");
        assert!(entries[0].deleted);
        assert_eq!(entries[0].cluster, 5);
    }

    #[test]
    fn lfn_parts_accumulate_in_reverse() {
        // two LFN slots arriving highest-sequence first, then the short entry
        let mut lfn2 = vec![0u8; 32];
        lfn2[0] = 0x42;
        lfn2[11] = 0x0F;
        let tail: Vec<u16> = "name.png\0".encode_utf16().collect();
        let mut raw = Vec::new();
        for u in &tail {
            raw.extend_from_slice(&u.to_le_bytes());
        }
        raw.resize(26, 0xFF);
        lfn2[1..11].copy_from_slice(&raw[0..10]);
        lfn2[14..26].copy_from_slice(&raw[10..22]);
        lfn2[28..32].copy_from_slice(&raw[22..26]);

        let mut lfn1 = vec![0u8; 32];
        lfn1[0] = 0x01;
        lfn1[11] = 0x0F;
        let head: Vec<u16> = "a very long f".encode_utf16().collect();
        let mut raw = Vec::new();
        for u in &head {
            raw.extend_from_slice(&u.to_le_bytes());
        }
        lfn1[1..11].copy_from_slice(&raw[0..10]);
        lfn1[14..26].copy_from_slice(&raw[10..22]);
        lfn1[28..32].copy_from_slice(&raw[22..26]);

        let mut data = Vec::new();
        data.extend_from_slice(&lfn2);
        data.extend_from_slice(&lfn1);
        data.extend_from_slice(&short_entry(b"AVERY~1PNG ", 0x20, 9, 123, false));

        let entries = parse_directory_entries(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a very long fname.png");
        assert_eq!(entries[0].extension, "png");
    }

    #[test]
    fn directory_end_marker_stops_parsing() {
        let mut data = short_entry(b"FILE    TXT", 0x20, 3, 10, false);
        data.extend_from_slice(&[0u8; 32]);
        data.extend_from_slice(&short_entry(b"GHOST   TXT", 0x20, 4, 10, false));
        assert_eq!(parse_directory_entries(&data).len(), 1);
    }
}
