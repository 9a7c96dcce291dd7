use chrono::NaiveDateTime;
use serde::ser::Serializer;
use serde::Serialize;
use std::fmt;

/// How likely the on-disk content of a deleted file is still intact,
/// judged from allocation metadata alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverabilityStatus {
    Recoverable,
    PartiallyRecoverable,
    Overwritten,
    Deleted,
    Unknown,
}

impl RecoverabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoverabilityStatus::Recoverable => "Recoverable",
            RecoverabilityStatus::PartiallyRecoverable => "Partially Recoverable",
            RecoverabilityStatus::Overwritten => "Overwritten",
            RecoverabilityStatus::Deleted => "Deleted",
            RecoverabilityStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for RecoverabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RecoverabilityStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outcome of the integrity scorer for one candidate.
///
/// `Unsupported` means the scorer has no rule for the format and
/// `NotEvaluated` means the pipeline never ran it; neither is a number and
/// neither may be coerced into one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntegrityVerdict {
    Score(f64),
    Unsupported,
    NotEvaluated,
}

impl IntegrityVerdict {
    pub fn render(&self) -> String {
        match self {
            IntegrityVerdict::Score(s) => format!("{s:.2}"),
            IntegrityVerdict::Unsupported => "N/A".to_string(),
            IntegrityVerdict::NotEvaluated => "Unknown".to_string(),
        }
    }
}

impl fmt::Display for IntegrityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Serialize for IntegrityVerdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

/// Engine-independent description of one recoverable file.
///
/// Timestamps are pre-rendered `dd/mm/yyyy HH:MM:SS` strings, empty when the
/// source metadata carried none. `start_unit` is the first cluster (FAT) or
/// first LCN (NTFS); carved candidates have no allocation unit.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredFileRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub extension: String,
    pub size: u64,
    pub created: String,
    pub modified: String,
    pub accessed: String,
    #[serde(rename = "full_path")]
    pub path: String,
    pub offset: u64,
    #[serde(rename = "start_cluster", skip_serializing_if = "Option::is_none")]
    pub start_unit: Option<u64>,
    pub status: RecoverabilityStatus,
    pub integrity: IntegrityVerdict,
}

pub fn format_timestamp(dt: Option<NaiveDateTime>) -> String {
    match dt {
        Some(dt) => dt.format("%d/%m/%Y %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Lowercase extension after the last dot, or "" when the name has none.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}
