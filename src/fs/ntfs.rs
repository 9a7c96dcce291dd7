//! NTFS MFT walker.
//!
//! Bootstraps the MFT from its own record 0, then decodes every file record
//! looking for deleted files with recoverable non-resident data.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use crate::error::{Result, ScanError};
use crate::io::BlockReader;
use crate::scan::ScanContext;
use crate::types::{extension_of, format_timestamp, RecoverabilityStatus, RecoveredFileRecord};

pub const BOOT_SECTOR_SIZE: usize = 512;

const NTFS_OEM: &[u8; 8] = b"NTFS    ";
const RECORD_MAGIC: &[u8; 4] = b"FILE";
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;
const FLAG_IN_USE: u16 = 0x0001;
const NAMESPACE_DOS: u8 = 2;
const ROOT_RECORD: u64 = 5;
const BITMAP_RECORD: u64 = 6;
const FIXUP_STRIDE: usize = 512;
const PATH_WALK_CAP: usize = 100;

// Difference between the FILETIME epoch (1601) and Unix epoch, in 100ns.
const FILETIME_UNIX_DIFF: i64 = 116_444_736_000_000_000;

// Caps against garbage run lengths in trashed records.
const MAX_BITMAP_BYTES: u64 = 256 * 1024 * 1024;
const MAX_CLASSIFY_CLUSTERS: u64 = 1 << 24;

/// Boot-sector fields of an NTFS volume.
#[derive(Debug, Clone)]
pub struct NtfsGeometry {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub mft_lcn: u64,
    clusters_per_record: i8,
}

impl NtfsGeometry {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(ScanError::CorruptMetadata(
                "boot sector shorter than 512 bytes".to_string(),
            ));
        }
        if &data[3..11] != NTFS_OEM {
            return Err(ScanError::InvalidSignature(
                "missing NTFS OEM signature".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(0x0B);
        let bytes_per_sector = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        cursor.set_position(0x0D);
        let sectors_per_cluster = cursor
            .read_u8()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        cursor.set_position(0x30);
        let mft_lcn = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        cursor.set_position(0x40);
        let clusters_per_record = cursor
            .read_i8()
            .map_err(|e| ScanError::CorruptMetadata(e.to_string()))?;

        let geometry = Self {
            bytes_per_sector,
            sectors_per_cluster,
            mft_lcn,
            clusters_per_record,
        };
        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(ScanError::CorruptMetadata(
                "zero cluster geometry".to_string(),
            ));
        }
        if geometry.record_size() < FIXUP_STRIDE as u64 {
            return Err(ScanError::CorruptMetadata(format!(
                "implausible MFT record size {}",
                geometry.record_size()
            )));
        }
        Ok(geometry)
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// A negative stored value encodes the record size as a power of two.
    pub fn record_size(&self) -> u64 {
        if self.clusters_per_record < 0 {
            1u64 << self.clusters_per_record.unsigned_abs()
        } else {
            self.clusters_per_record as u64 * self.cluster_size()
        }
    }

    pub fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size()
    }
}

/// One extent of a non-resident attribute. A sparse run has a length but no
/// disk position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub clusters: u64,
}

fn le_uint(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, &b) in bytes.iter().enumerate() {
        v |= (b as u64) << (8 * i);
    }
    v
}

fn le_int(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut v = 0i64;
    for (i, &b) in bytes.iter().enumerate() {
        v |= (b as i64) << (8 * i);
    }
    let shift = 64 - 8 * bytes.len();
    (v << shift) >> shift
}

/// Decodes a run list. Each run starts with a header byte whose low nibble
/// is the byte width of the cluster count and whose high nibble is the byte
/// width of the signed LCN delta; deltas accumulate. A zero header ends the
/// list. Decoding stops at the first run that would place data at a negative
/// LCN.
pub fn decode_runs(data: &[u8]) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn = 0i64;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let len_len = (header & 0x0F) as usize;
        let off_len = (header >> 4) as usize;
        pos += 1;
        if len_len > 8 || off_len > 8 || pos + len_len + off_len > data.len() {
            break;
        }

        let clusters = le_uint(&data[pos..pos + len_len]);
        pos += len_len;
        let delta = le_int(&data[pos..pos + off_len]);
        pos += off_len;

        if off_len == 0 {
            runs.push(DataRun {
                lcn: None,
                clusters,
            });
        } else {
            lcn += delta;
            if lcn < 0 {
                break;
            }
            runs.push(DataRun {
                lcn: Some(lcn as u64),
                clusters,
            });
        }
    }
    runs
}

fn u16_at(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn u32_at(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn u64_at(data: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

/// Replaces the update-sequence placeholders at the end of each 512-byte
/// stride with their real bytes. Until this runs, any multi-sector record
/// has two bogus bytes per sector.
pub fn apply_fixup(record: &mut [u8]) -> Result<()> {
    if record.len() < 8 {
        return Err(ScanError::CorruptMetadata("record too short".to_string()));
    }
    let usa_offset = u16_at(record, 4) as usize;
    let usa_count = u16_at(record, 6) as usize;
    if usa_count < 2 || usa_offset + usa_count * 2 > record.len() {
        return Err(ScanError::CorruptMetadata(
            "update sequence array out of bounds".to_string(),
        ));
    }

    let sequence = [record[usa_offset], record[usa_offset + 1]];
    for i in 1..usa_count {
        let end = i * FIXUP_STRIDE;
        if end > record.len() {
            return Err(ScanError::CorruptMetadata(
                "update sequence array covers more sectors than the record".to_string(),
            ));
        }
        if record[end - 2..end] != sequence {
            return Err(ScanError::CorruptMetadata(format!(
                "update sequence mismatch in sector {i}"
            )));
        }
        record[end - 2] = record[usa_offset + i * 2];
        record[end - 1] = record[usa_offset + i * 2 + 1];
    }
    Ok(())
}

pub fn filetime_to_datetime(ft: u64) -> Option<NaiveDateTime> {
    if ft == 0 {
        return None;
    }
    let unix_secs = (ft as i64 - FILETIME_UNIX_DIFF) / 10_000_000;
    DateTime::from_timestamp(unix_secs, 0).map(|dt| dt.naive_utc())
}

#[derive(Debug, Clone)]
struct FileNameAttr {
    parent: u64,
    name: String,
    created: Option<NaiveDateTime>,
    modified: Option<NaiveDateTime>,
    accessed: Option<NaiveDateTime>,
}

/// Iterates (offset, type, length, non_resident) attribute headers.
fn attributes(record: &[u8]) -> impl Iterator<Item = (usize, u32, usize, bool)> + '_ {
    let mut pos = if record.len() >= 0x16 {
        u16_at(record, 0x14) as usize
    } else {
        record.len()
    };
    std::iter::from_fn(move || {
        if pos + 8 > record.len() {
            return None;
        }
        let attr_type = u32_at(record, pos);
        if attr_type == ATTR_END {
            return None;
        }
        let attr_len = u32_at(record, pos + 4) as usize;
        if attr_len < 16 || pos + attr_len > record.len() {
            return None;
        }
        let current = pos;
        pos += attr_len;
        Some((current, attr_type, attr_len, record[current + 8] != 0))
    })
}

/// Best $FILE_NAME attribute of a record: the first non-DOS name, falling
/// back to a DOS-only short name if that is all the record has.
fn extract_file_name(record: &[u8]) -> Option<FileNameAttr> {
    let mut fallback = None;
    for (pos, attr_type, _len, non_resident) in attributes(record) {
        if attr_type != ATTR_FILE_NAME || non_resident {
            continue;
        }
        if pos + 22 > record.len() {
            continue;
        }
        let content_size = u32_at(record, pos + 16) as usize;
        let content_offset = u16_at(record, pos + 20) as usize;
        let start = pos + content_offset;
        if start + content_size > record.len() || content_size < 0x42 {
            continue;
        }
        let content = &record[start..start + content_size];

        let name_len = content[0x40] as usize;
        if 0x42 + name_len * 2 > content.len() {
            continue;
        }
        let units: Vec<u16> = content[0x42..0x42 + name_len * 2]
            .chunks_exact(2)
            .map(|c| u16_at(c, 0))
            .collect();
        let attr = FileNameAttr {
            parent: u64_at(content, 0) & 0xFFFF_FFFF_FFFF,
            name: String::from_utf16_lossy(&units),
            created: filetime_to_datetime(u64_at(content, 0x10)),
            modified: filetime_to_datetime(u64_at(content, 0x18)),
            accessed: filetime_to_datetime(u64_at(content, 0x20)),
        };
        if content[0x41] != NAMESPACE_DOS {
            return Some(attr);
        }
        fallback.get_or_insert(attr);
    }
    fallback
}

/// Non-resident $DATA of a record: its run list and real (byte) size.
fn extract_data_info(record: &[u8]) -> Option<(Vec<DataRun>, u64)> {
    for (pos, attr_type, len, non_resident) in attributes(record) {
        if attr_type != ATTR_DATA || !non_resident {
            continue;
        }
        if pos + 0x40 > record.len() {
            return None;
        }
        let run_offset = u16_at(record, pos + 0x20) as usize;
        let real_size = u64_at(record, pos + 0x30);
        if run_offset >= len {
            return None;
        }
        let runs = decode_runs(&record[pos + run_offset..pos + len]);
        return Some((runs, real_size));
    }
    None
}

/// Recoverability policy for NTFS candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoverabilityPolicy {
    /// Report every deleted record as `Deleted` without touching $Bitmap.
    #[default]
    Minimal,
    /// Classify each candidate's runs against the volume $Bitmap.
    Bitmap,
}

/// Classifies a candidate's runs against the cluster allocation bitmap.
/// Bit L of the bitmap (byte L/8, bit L%8) is set when cluster L is
/// allocated to a live file.
pub fn classify_runs(runs: &[DataRun], bitmap: &[u8]) -> RecoverabilityStatus {
    if runs.is_empty() {
        return RecoverabilityStatus::Unknown;
    }
    let mut allocated = 0u64;
    let mut free = 0u64;
    let mut unknown = 0u64;
    let mut examined = 0u64;

    for run in runs {
        if run.clusters == 0 {
            unknown += 1;
            continue;
        }
        let Some(start) = run.lcn else {
            unknown += run.clusters;
            continue;
        };
        for i in 0..run.clusters {
            examined += 1;
            if examined > MAX_CLASSIFY_CLUSTERS {
                return RecoverabilityStatus::Unknown;
            }
            let lcn = start + i;
            let byte = (lcn / 8) as usize;
            if byte >= bitmap.len() {
                unknown += 1;
            } else if bitmap[byte] >> (lcn % 8) & 1 == 1 {
                allocated += 1;
            } else {
                free += 1;
            }
        }
    }

    if allocated == 0 && free == 0 {
        RecoverabilityStatus::Unknown
    } else if unknown > 0 && allocated == 0 {
        RecoverabilityStatus::PartiallyRecoverable
    } else if allocated == 0 {
        RecoverabilityStatus::Recoverable
    } else if free == 0 {
        RecoverabilityStatus::Overwritten
    } else {
        RecoverabilityStatus::PartiallyRecoverable
    }
}

/// A parsed NTFS volume with the MFT extents mapped.
pub struct NtfsVolume {
    pub geometry: NtfsGeometry,
    mft_runs: Vec<DataRun>,
    mft_size: u64,
}

impl NtfsVolume {
    pub fn open<R: BlockReader>(ctx: &mut ScanContext<'_, R>) -> Result<Self> {
        let boot = ctx.read_exact_at(0, BOOT_SECTOR_SIZE)?;
        let geometry = NtfsGeometry::parse(&boot)?;

        let record_size = geometry.record_size() as usize;
        let mut record = ctx.read_exact_at(geometry.mft_offset(), record_size)?;
        if &record[..4] != RECORD_MAGIC {
            return Err(ScanError::CorruptMetadata(
                "$MFT record 0 has no FILE signature".to_string(),
            ));
        }
        apply_fixup(&mut record)?;
        let (mft_runs, mft_size) = extract_data_info(&record).ok_or_else(|| {
            ScanError::CorruptMetadata("$MFT record 0 has no non-resident data".to_string())
        })?;

        tracing::info!(
            cluster_size = geometry.cluster_size(),
            record_size,
            mft_size,
            extents = mft_runs.len(),
            "NTFS volume opened"
        );
        Ok(Self {
            geometry,
            mft_runs,
            mft_size,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.mft_size / self.geometry.record_size()
    }

    /// Maps a record index through the MFT extents and reads its raw bytes.
    /// Indices that land in sparse extents or past the mapped space yield
    /// `None`.
    fn read_record<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
        index: u64,
    ) -> Option<Vec<u8>> {
        let record_size = self.geometry.record_size();
        let cluster_size = self.geometry.cluster_size();
        let logical = index * record_size;

        let mut cursor = 0u64;
        for run in &self.mft_runs {
            let run_bytes = run.clusters * cluster_size;
            if logical < cursor + run_bytes {
                let inside = logical - cursor;
                let lcn = run.lcn?;
                let offset = lcn * cluster_size + inside;
                return ctx.read_exact_at(offset, record_size as usize).ok();
            }
            cursor += run_bytes;
        }
        None
    }

    /// Decodes one record into a usable (fixed-up) buffer, or `None` for
    /// free record slots and records whose update sequence does not verify.
    fn decode_record<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
        index: u64,
    ) -> Option<Vec<u8>> {
        let mut record = self.read_record(ctx, index)?;
        if &record[..4] != RECORD_MAGIC {
            return None;
        }
        if let Err(e) = apply_fixup(&mut record) {
            tracing::debug!(record = index, error = %e, "skipping record");
            return None;
        }
        Some(record)
    }

    /// One pass over the MFT collecting record index -> (name, parent) for
    /// path reconstruction, regardless of in-use state.
    fn build_name_map<R: BlockReader>(
        &self,
        ctx: &mut ScanContext<'_, R>,
    ) -> HashMap<u64, (String, u64)> {
        let mut map = HashMap::new();
        for index in 0..self.record_count() {
            if ctx.cancelled() {
                break;
            }
            let Some(record) = self.decode_record(ctx, index) else {
                continue;
            };
            if let Some(attr) = extract_file_name(&record) {
                map.insert(index, (attr.name, attr.parent));
            }
        }
        map
    }

    /// Best-effort absolute path of `index`, `\`-joined, walking parents up
    /// to the root record with a hop cap against parent-reference loops.
    fn build_path(&self, index: u64, names: &HashMap<u64, (String, u64)>) -> String {
        let mut parts = Vec::new();
        let mut seen = HashSet::new();
        let mut current = index;
        for _ in 0..PATH_WALK_CAP {
            // corrupted parent references can loop below the root
            if !seen.insert(current) {
                break;
            }
            let Some((name, parent)) = names.get(&current) else {
                break;
            };
            parts.push(name.clone());
            current = *parent;
            if current == ROOT_RECORD {
                break;
            }
        }
        parts.reverse();
        parts.join("\\")
    }

    /// Reads the $Bitmap contents (well-known record 6). Sparse extents read
    /// as zero bytes. `None` when the bitmap is absent or oversized.
    fn load_bitmap<R: BlockReader>(&self, ctx: &mut ScanContext<'_, R>) -> Option<Vec<u8>> {
        let record = self.decode_record(ctx, BITMAP_RECORD)?;
        let (runs, size) = extract_data_info(&record)?;
        if size == 0 || size > MAX_BITMAP_BYTES {
            return None;
        }

        let cluster_size = self.geometry.cluster_size();
        let mut bitmap = Vec::with_capacity(size as usize);
        for run in &runs {
            if bitmap.len() as u64 >= size {
                break;
            }
            let wanted = ((size - bitmap.len() as u64).min(run.clusters * cluster_size)) as usize;
            match run.lcn {
                Some(lcn) => {
                    let chunk = ctx.read_at(lcn * cluster_size, wanted).ok()?;
                    if chunk.len() < wanted {
                        return None;
                    }
                    bitmap.extend_from_slice(&chunk);
                }
                None => bitmap.resize(bitmap.len() + wanted, 0),
            }
        }
        if (bitmap.len() as u64) < size {
            return None;
        }
        Some(bitmap)
    }
}

/// Full deleted-file scan of an NTFS volume. A first MFT pass builds the
/// parent map for paths; the second decodes every record that is not in use
/// and still has non-resident data on disk.
pub fn scan_volume<R: BlockReader>(ctx: &mut ScanContext<'_, R>) -> Result<()> {
    let volume = NtfsVolume::open(ctx)?;
    let total = volume.record_count();

    let bitmap = match ctx.options().ntfs_policy {
        RecoverabilityPolicy::Minimal => None,
        RecoverabilityPolicy::Bitmap => {
            let loaded = volume.load_bitmap(ctx);
            if loaded.is_none() {
                tracing::warn!("$Bitmap unreadable, statuses degrade to Unknown");
            }
            loaded
        }
    };

    let names = volume.build_name_map(ctx);
    tracing::info!(records = total, named = names.len(), "MFT mapped");

    for index in 0..total {
        if ctx.cancelled() {
            return Ok(());
        }
        if total > 0 {
            ctx.progress((index * 100 / total) as u8);
        }

        let Some(record) = volume.decode_record(ctx, index) else {
            continue;
        };
        if u16_at(&record, 0x16) & FLAG_IN_USE != 0 {
            continue;
        }
        let Some(name_attr) = extract_file_name(&record) else {
            continue;
        };
        let Some((runs, size)) = extract_data_info(&record) else {
            continue;
        };
        let Some(start_lcn) = runs.first().and_then(|r| r.lcn).filter(|&l| l > 0) else {
            continue;
        };

        let status = match (ctx.options().ntfs_policy, &bitmap) {
            (RecoverabilityPolicy::Minimal, _) => RecoverabilityStatus::Deleted,
            (RecoverabilityPolicy::Bitmap, Some(bits)) => classify_runs(&runs, bits),
            (RecoverabilityPolicy::Bitmap, None) => RecoverabilityStatus::Unknown,
        };

        ctx.emit(RecoveredFileRecord {
            name: name_attr.name.clone(),
            extension: extension_of(&name_attr.name),
            size,
            created: format_timestamp(name_attr.created),
            modified: format_timestamp(name_attr.modified),
            accessed: format_timestamp(name_attr.accessed),
            path: volume.build_path(index, &names),
            offset: start_lcn * volume.geometry.cluster_size(),
            start_unit: Some(start_lcn),
            status,
            integrity: crate::types::IntegrityVerdict::NotEvaluated,
        });
    }
    Ok(())
}
