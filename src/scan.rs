//! Scan orchestration.
//!
//! The state machine, cancellation token, progress reporting, and the
//! record pipeline shared by every engine live here. Engines receive a
//! [`ScanContext`] and stream records through it; integrity scoring happens
//! on the way to the caller's sink.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::carve::{self, CarveConfig, DirectorySink};
use crate::error::{Result, ScanError};
use crate::fs::ntfs::RecoverabilityPolicy;
use crate::fs::{fat, ntfs};
use crate::integrity;
use crate::io::BlockReader;
use crate::types::{IntegrityVerdict, RecoverabilityStatus, RecoveredFileRecord};

pub const DEFAULT_INTEGRITY_GATE: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// FAT32 directory-tree walk.
    Fat,
    /// NTFS MFT walk.
    Ntfs,
    /// Filesystem-agnostic signature carve.
    Carve,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Fat => "fat32",
            EngineKind::Ntfs => "ntfs",
            EngineKind::Carve => "carve",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Initializing,
    Scanning,
    Completed,
    Cancelled,
    Failed,
}

impl ScanState {
    pub fn name(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Initializing => "initializing",
            ScanState::Scanning => "scanning",
            ScanState::Completed => "completed",
            ScanState::Cancelled => "cancelled",
            ScanState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Cancelled | ScanState::Failed
        )
    }
}

/// Shared cancellation flag. Any thread may set it; engines observe it at
/// entry, record, and chunk boundaries and wind down keeping what they have.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

pub type ProgressCallback = Box<dyn Fn(u8) + Send + Sync>;

/// Percentage reporter that never goes backwards.
pub struct ProgressTracker {
    last: u8,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self { last: 0, callback }
    }

    pub fn report(&mut self, pct: u8) {
        let pct = pct.min(100);
        if pct > self.last {
            self.last = pct;
            if let Some(callback) = &self.callback {
                callback(pct);
            }
        }
    }

    pub fn finish(&mut self) {
        self.report(100);
    }

    pub fn current(&self) -> u8 {
        self.last
    }
}

/// Receives records as the engines find them.
pub trait RecordSink {
    fn push(&mut self, record: RecoveredFileRecord);
}

impl RecordSink for Vec<RecoveredFileRecord> {
    fn push(&mut self, record: RecoveredFileRecord) {
        Vec::push(self, record);
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub engine: EngineKind,
    pub ntfs_policy: RecoverabilityPolicy,
    pub carve: CarveConfig,
    /// Payloads at or past this size are reported but never read back for
    /// scoring.
    pub integrity_gate: u64,
    /// Byte cap for the carve engine; `None` scans the whole device.
    pub byte_budget: Option<u64>,
    /// Where the carve engine persists payloads.
    pub output_dir: PathBuf,
}

impl ScanOptions {
    pub fn new(engine: EngineKind) -> Self {
        Self {
            engine,
            ntfs_policy: RecoverabilityPolicy::default(),
            carve: CarveConfig::default(),
            integrity_gate: DEFAULT_INTEGRITY_GATE,
            byte_budget: None,
            output_dir: PathBuf::from("recovered_files"),
        }
    }
}

/// Everything an engine needs while running: device access, the record
/// pipeline, progress, and cancellation. Owns the scoring gate so engines
/// only describe what they found.
pub struct ScanContext<'a, R: BlockReader> {
    reader: &'a mut R,
    sink: &'a mut dyn RecordSink,
    progress: &'a mut ProgressTracker,
    cancel: CancelToken,
    options: &'a ScanOptions,
    records_emitted: u64,
    cycles_detected: u64,
}

impl<'a, R: BlockReader> ScanContext<'a, R> {
    pub fn new(
        reader: &'a mut R,
        sink: &'a mut dyn RecordSink,
        progress: &'a mut ProgressTracker,
        cancel: CancelToken,
        options: &'a ScanOptions,
    ) -> Self {
        Self {
            reader,
            sink,
            progress,
            cancel,
            options,
            records_emitted: 0,
            cycles_detected: 0,
        }
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.reader.read_at(offset, len)
    }

    pub fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.reader.read_exact_at(offset, len)
    }

    pub fn device_size(&self) -> u64 {
        self.reader.size()
    }

    pub fn options(&self) -> &ScanOptions {
        self.options
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&mut self, pct: u8) {
        self.progress.report(pct);
    }

    /// Called when an allocation chain loops back on itself. The walk stops
    /// there; the scan keeps going.
    pub fn note_cycle(&mut self, unit: u64) {
        self.cycles_detected += 1;
        tracing::warn!(error = %ScanError::CycleDetected(unit), "stopping this walk");
    }

    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    pub fn cycles_detected(&self) -> u64 {
        self.cycles_detected
    }

    /// Scores the record when its engine's gate allows, then forwards it.
    pub fn emit(&mut self, mut record: RecoveredFileRecord) {
        record.integrity = self.gate_and_score(&record);
        self.records_emitted += 1;
        self.sink.push(record);
    }

    /// Forwards a carved record, scoring from the bytes already in hand.
    pub fn emit_carved(&mut self, mut record: RecoveredFileRecord, data: &[u8]) {
        record.integrity = integrity::score(&record.extension, data);
        self.records_emitted += 1;
        self.sink.push(record);
    }

    fn gate_and_score(&mut self, record: &RecoveredFileRecord) -> IntegrityVerdict {
        let gate = self.options.integrity_gate;
        match self.options.engine {
            EngineKind::Fat => {
                // Only clusters still marked free are worth reading back.
                if record.status == RecoverabilityStatus::Recoverable
                    && record.size > 0
                    && record.size < gate
                {
                    self.score_from_device(record)
                } else if record.size == 0 || record.status != RecoverabilityStatus::Recoverable {
                    IntegrityVerdict::Score(0.0)
                } else {
                    IntegrityVerdict::NotEvaluated
                }
            }
            EngineKind::Ntfs => {
                if record.size > 0 && record.size < gate {
                    self.score_from_device(record)
                } else if record.size == 0 {
                    IntegrityVerdict::Score(0.0)
                } else {
                    IntegrityVerdict::NotEvaluated
                }
            }
            EngineKind::Carve => IntegrityVerdict::NotEvaluated,
        }
    }

    fn score_from_device(&mut self, record: &RecoveredFileRecord) -> IntegrityVerdict {
        match self.reader.read_at(record.offset, record.size as usize) {
            Ok(data) => integrity::score(&record.extension, &data),
            Err(e) => {
                tracing::debug!(offset = record.offset, error = %e, "payload unreadable");
                IntegrityVerdict::NotEvaluated
            }
        }
    }
}

/// Outcome of one scan invocation. Emitted records are already with the
/// caller's sink whatever the terminal state.
#[derive(Debug)]
pub struct ScanReport {
    pub state: ScanState,
    pub records_emitted: u64,
    pub cycles_detected: u64,
    pub error: Option<ScanError>,
}

fn transition(from: ScanState, to: ScanState) -> ScanState {
    tracing::debug!(from = from.name(), to = to.name(), "scan state");
    to
}

/// Runs one engine over one device and streams records into `sink`.
pub fn run_scan<R: BlockReader>(
    reader: &mut R,
    options: &ScanOptions,
    sink: &mut dyn RecordSink,
    cancel: CancelToken,
    progress_callback: Option<ProgressCallback>,
) -> ScanReport {
    let mut progress = ProgressTracker::new(progress_callback);
    let mut state = transition(ScanState::Idle, ScanState::Initializing);

    tracing::info!(
        engine = options.engine.name(),
        device_size = reader.size(),
        "scan starting"
    );

    state = transition(state, ScanState::Scanning);
    let mut ctx = ScanContext::new(reader, sink, &mut progress, cancel.clone(), options);
    let result = match options.engine {
        EngineKind::Fat => fat::scan_volume(&mut ctx),
        EngineKind::Ntfs => ntfs::scan_volume(&mut ctx),
        EngineKind::Carve => match DirectorySink::new(&options.output_dir) {
            Ok(mut carve_sink) => carve::scan_device(&mut ctx, &mut carve_sink),
            Err(e) => Err(e),
        },
    };
    let records_emitted = ctx.records_emitted();
    let cycles_detected = ctx.cycles_detected();
    drop(ctx);

    match result {
        Ok(()) => {
            let terminal = if cancel.is_cancelled() {
                ScanState::Cancelled
            } else {
                ScanState::Completed
            };
            state = transition(state, terminal);
            progress.finish();
            tracing::info!(
                state = state.name(),
                records = records_emitted,
                cycles = cycles_detected,
                "scan finished"
            );
            ScanReport {
                state,
                records_emitted,
                cycles_detected,
                error: None,
            }
        }
        Err(e) => {
            state = transition(state, ScanState::Failed);
            tracing::error!(error = %e, records = records_emitted, "scan failed");
            ScanReport {
                state,
                records_emitted,
                cycles_detected,
                error: Some(e),
            }
        }
    }
}
