// error.rs — Error types for the evidence ledger.

use std::path::PathBuf;
use thiserror::Error;

use crate::signing::SignError;

/// Errors that can occur while recording, sealing or verifying evidence.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Append attempted after the ledger was sealed.
    #[error("ledger for run {run_id} is sealed")]
    Sealed { run_id: String },

    /// `seal` called again with a different summary.
    #[error("ledger for run {run_id} was already sealed with different contents")]
    AlreadySealed { run_id: String },

    /// Failed to open or create the journal file.
    #[error("failed to open ledger journal at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A journal already exists where a new ledger was to be created.
    #[error("ledger journal already exists at {0}")]
    JournalExists(PathBuf),

    /// Failed to write an entry to the journal.
    #[error("failed to append ledger entry: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// A journal line before the last one does not parse.
    #[error("corrupt ledger journal {path} at line {line}: {source}")]
    CorruptJournal {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    /// Failed to serialize or deserialize an entry.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The hash chain does not reproduce: tampering, truncation or reordering.
    #[error("chain integrity violation at entry {seq}: {reason}")]
    ChainIntegrityViolation { seq: u64, reason: String },

    /// The external signer failed.
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
}
