pub mod carve;
pub mod error;
pub mod fs;
pub mod integrity;
pub mod io;
pub mod scan;
pub mod types;

pub use error::{Result, ScanError};
pub use scan::{
    CancelToken, EngineKind, ProgressCallback, RecordSink, ScanOptions, ScanReport, ScanState,
    run_scan,
};
pub use types::{IntegrityVerdict, RecoverabilityStatus, RecoveredFileRecord};
