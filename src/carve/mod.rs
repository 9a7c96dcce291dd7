//! Signature-based deep carver.
//!
//! Streams the device through a rolling buffer, finds format headers with a
//! multi-pattern matcher, and resolves each candidate's end by its format's
//! boundary strategy. Validated payloads are persisted through a sink and
//! emitted as records.

pub mod signatures;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use memchr::memmem;

use crate::error::{Result, ScanError};
use crate::io::BlockReader;
use crate::scan::ScanContext;
use crate::types::{IntegrityVerdict, RecoverabilityStatus, RecoveredFileRecord};

use signatures::{BoundaryStrategy, CarveFormat, CarveSignature, SignatureRegistry};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_RETAINED: usize = 64 * 1024 * 1024;

/// Buffer tuning for the streaming scan. `retained` must cover the largest
/// signature `max_size` or candidates near the cap can never resolve.
#[derive(Debug, Clone)]
pub struct CarveConfig {
    pub chunk_size: usize,
    pub retained: usize,
}

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retained: DEFAULT_RETAINED,
        }
    }
}

/// Destination for carved payloads.
pub trait CarveSink {
    /// Persists one payload and returns the path recorded for it.
    fn persist(&mut self, extension: &str, offset: u64, data: &[u8]) -> Result<PathBuf>;
}

/// Writes each payload as `<ext>_<offset hex>.<ext>` under one directory.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

impl CarveSink for DirectorySink {
    fn persist(&mut self, extension: &str, offset: u64, data: &[u8]) -> Result<PathBuf> {
        let path = self.dir.join(format!("{extension}_{offset:08x}.{extension}"));
        fs::write(&path, data)?;
        Ok(path)
    }
}

enum Resolution {
    /// Exclusive end of the payload, buffer-relative.
    Complete(usize),
    /// The boundary may still arrive with more data.
    Pending,
    /// `max_size` bytes seen with no boundary; the candidate is dead.
    Exhausted,
}

fn resolve(sig: &CarveSignature, buffer: &[u8], pos: usize) -> Resolution {
    let window_full = pos as u64 + sig.max_size <= buffer.len() as u64;
    match sig.boundary {
        BoundaryStrategy::Trailer { pattern, advance } => {
            let search_start = pos + sig.header.len();
            let limit = buffer.len().min(pos.saturating_add(sig.max_size as usize));
            if search_start >= limit {
                return if window_full {
                    Resolution::Exhausted
                } else {
                    Resolution::Pending
                };
            }
            match memmem::find(&buffer[search_start..limit], pattern) {
                Some(rel) => {
                    let end = search_start + rel + advance;
                    if end <= buffer.len() {
                        Resolution::Complete(end)
                    } else {
                        Resolution::Pending
                    }
                }
                None if window_full => Resolution::Exhausted,
                None => Resolution::Pending,
            }
        }
        BoundaryStrategy::DeclaredLength { at, base } => {
            if pos + at + 4 > buffer.len() {
                return Resolution::Pending;
            }
            let declared = u32::from_le_bytes([
                buffer[pos + at],
                buffer[pos + at + 1],
                buffer[pos + at + 2],
                buffer[pos + at + 3],
            ]) as u64;
            let span = base + declared;
            if span > sig.max_size {
                return Resolution::Exhausted;
            }
            let end = pos as u64 + span;
            if end <= buffer.len() as u64 {
                Resolution::Complete(end as usize)
            } else {
                Resolution::Pending
            }
        }
    }
}

/// Deep scan of a raw device. Filesystem metadata is never consulted; every
/// byte within the budget is examined for format signatures.
pub fn scan_device<R: BlockReader>(
    ctx: &mut ScanContext<'_, R>,
    sink: &mut dyn CarveSink,
) -> Result<()> {
    let registry = SignatureRegistry::new();
    let config = ctx.options().carve.clone();
    let budget = ctx
        .options()
        .byte_budget
        .unwrap_or(u64::MAX)
        .min(ctx.device_size());

    tracing::info!(budget, chunk = config.chunk_size, "deep carve started");

    let mut buffer: Vec<u8> = Vec::new();
    // Absolute device offset of buffer[0].
    let mut base: u64 = 0;
    let mut consumed: u64 = 0;
    // Absolute [start, end) of every persisted payload still near the window.
    let mut accepted: Vec<(u64, u64)> = Vec::new();
    // Absolute header offsets that failed validation or exhausted their window.
    let mut rejected: HashSet<u64> = HashSet::new();

    while consumed < budget {
        if ctx.cancelled() {
            return Ok(());
        }

        let want = config.chunk_size.min((budget - consumed) as usize);
        let chunk = match ctx.read_at(consumed, want) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(offset = consumed, error = %e, "device read failed, stopping");
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        consumed += chunk.len() as u64;
        buffer.extend_from_slice(&chunk);

        scan_buffer(
            ctx,
            sink,
            &registry,
            &buffer,
            base,
            &mut accepted,
            &mut rejected,
        )?;

        if buffer.len() > config.retained {
            let evict = buffer.len() - config.retained;
            buffer.drain(..evict);
            base += evict as u64;
            rejected.retain(|&off| off >= base);
            accepted.retain(|&(_, end)| end > base);
        }

        ctx.progress((consumed * 100 / budget.max(1)) as u8);
    }

    tracing::info!(bytes = consumed, "deep carve finished");
    Ok(())
}

/// One pass over the current window. A candidate whose boundary has not
/// arrived stalls its format for this pass so a later header cannot steal
/// the boundary an earlier one is waiting for.
fn scan_buffer<R: BlockReader>(
    ctx: &mut ScanContext<'_, R>,
    sink: &mut dyn CarveSink,
    registry: &SignatureRegistry,
    buffer: &[u8],
    base: u64,
    accepted: &mut Vec<(u64, u64)>,
    rejected: &mut HashSet<u64>,
) -> Result<()> {
    let mut stalled: HashSet<CarveFormat> = HashSet::new();

    for (pos, sig) in registry.find_headers(buffer) {
        if ctx.cancelled() {
            return Ok(());
        }
        if stalled.contains(&sig.format) {
            continue;
        }
        let abs = base + pos as u64;
        if rejected.contains(&abs) {
            continue;
        }
        if accepted.iter().any(|&(start, end)| abs >= start && abs < end) {
            continue;
        }

        match resolve(sig, buffer, pos) {
            Resolution::Pending => {
                stalled.insert(sig.format);
            }
            Resolution::Exhausted => {
                rejected.insert(abs);
            }
            Resolution::Complete(end) => {
                let data = &buffer[pos..end];
                let Some(extension) = sig.validate(data) else {
                    let reason = ScanError::ValidationFailed(sig.format.name().to_string());
                    tracing::debug!(offset = abs, error = %reason, "candidate rejected");
                    rejected.insert(abs);
                    continue;
                };

                let path = sink.persist(extension, abs, data)?;
                accepted.push((abs, base + end as u64));
                tracing::debug!(offset = abs, size = data.len(), extension, "payload carved");

                let record = RecoveredFileRecord {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    extension: extension.to_string(),
                    size: data.len() as u64,
                    created: String::new(),
                    modified: String::new(),
                    accessed: String::new(),
                    path: path.display().to_string(),
                    offset: abs,
                    start_unit: None,
                    status: RecoverabilityStatus::Unknown,
                    integrity: IntegrityVerdict::NotEvaluated,
                };
                ctx.emit_carved(record, data);
            }
        }
    }
    Ok(())
}
