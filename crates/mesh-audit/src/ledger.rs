// ledger.rs — Append-only, hash-chained evidence ledger for one run.
//
// The ledger is owned by exactly one orchestrator. Each append assigns the
// next sequence index, stamps the entry, links it to the previous chain hash
// and (when journaled) writes it as one JSONL line before returning, so a
// restarted orchestrator can rebuild the run from the journal alone.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::canonical;
use crate::entry::{ApprovalDraft, LedgerEntry, Step, StepDraft, StepOutcome};
use crate::error::LedgerError;
use crate::hasher;
use crate::pack::{Attestation, AttestationPayload, EvidencePack, RunSummary, PACK_FORMAT_VERSION};
use crate::signing::Signer;

struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
}

pub struct EvidenceLedger {
    run_id: String,
    entries: Vec<LedgerEntry>,
    head: String,
    journal: Option<Journal>,
    sealed: Option<EvidencePack>,
}

impl EvidenceLedger {
    /// In-memory ledger rooted at the chain seed.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
            head: hasher::chain_seed(),
            journal: None,
            sealed: None,
        }
    }

    /// New ledger that also journals every entry to `path`.
    ///
    /// Fails if a journal already exists there; use [`open_journal`](Self::open_journal)
    /// to resume one.
    pub fn create_journal(run_id: impl Into<String>, path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => LedgerError::JournalExists(path.to_path_buf()),
                _ => LedgerError::OpenFailed {
                    path: path.to_path_buf(),
                    source,
                },
            })?;
        let mut ledger = Self::new(run_id);
        ledger.journal = Some(Journal {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        });
        Ok(ledger)
    }

    /// Resume a journaled ledger, verifying its chain from the seed.
    pub fn open_journal(run_id: impl Into<String>, path: &Path) -> Result<Self, LedgerError> {
        let entries = Self::read_journal(path)?;
        let head = verify_entries(&entries)?;
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|source| LedgerError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            run_id: run_id.into(),
            entries,
            head,
            journal: Some(Journal {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
            }),
            sealed: None,
        })
    }

    /// Read every entry of a journal, oldest first. Blank lines are skipped.
    ///
    /// A final line that does not parse is an append torn by a crash: it is
    /// cut from the file and the entries before it are returned. A bad line
    /// anywhere else is [`LedgerError::CorruptJournal`].
    pub fn read_journal(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
        let bytes = std::fs::read(path).map_err(|source| LedgerError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let mut entries = Vec::new();
        let mut offset = 0;
        let mut lines = bytes.split_inclusive(|b| *b == b'\n').enumerate().peekable();
        while let Some((index, line)) = lines.next() {
            let start = offset;
            offset += line.len();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(entry) => entries.push(entry),
                Err(source) if lines.peek().is_none() => {
                    tracing::warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %source,
                        "dropping torn last line of ledger journal"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(start as u64)?;
                    file.sync_all()?;
                }
                Err(source) => {
                    return Err(LedgerError::CorruptJournal {
                        path: path.to_path_buf(),
                        line: index + 1,
                        source,
                    })
                }
            }
        }
        Ok(entries)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Chain hash of the last entry (the seed when empty).
    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.path.as_path())
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.entries.iter().filter_map(LedgerEntry::as_step)
    }

    /// Sequence index the next entry will get.
    pub fn next_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    /// The SUCCESS step recorded for an idempotency key, if any.
    pub fn find_success(&self, idempotency_key: &str) -> Option<&Step> {
        self.steps().find(|s| {
            s.outcome == StepOutcome::Success
                && s.idempotency_key.as_deref() == Some(idempotency_key)
        })
    }

    pub fn record_step(&mut self, draft: StepDraft) -> Result<String, LedgerError> {
        let step = draft.into_step(self.next_seq(), canonical::now());
        self.append(LedgerEntry::Step(step))
    }

    pub fn record_approval(&mut self, draft: ApprovalDraft) -> Result<String, LedgerError> {
        let approval = draft.into_approval(self.next_seq(), canonical::now());
        self.append(LedgerEntry::Approval(approval))
    }

    /// Link `entry` to the chain, journal it, and return the new head.
    fn append(&mut self, mut entry: LedgerEntry) -> Result<String, LedgerError> {
        if self.sealed.is_some() {
            return Err(LedgerError::Sealed {
                run_id: self.run_id.clone(),
            });
        }
        let hash = hasher::chain_next(&self.head, &entry.canonical_bytes()?);
        entry.set_chain_hash(hash.clone());

        if let Some(journal) = self.journal.as_mut() {
            let line = serde_json::to_string(&entry)?;
            writeln!(journal.writer, "{}", line)?;
            journal.writer.flush()?;
        }

        self.entries.push(entry);
        self.head = hash.clone();
        Ok(hash)
    }

    /// Produce the evidence pack. Callable once; a repeat call with the same
    /// summary returns the same pack, a different summary is refused.
    pub fn seal(&mut self, summary: RunSummary, signer: &dyn Signer) -> Result<EvidencePack, LedgerError> {
        if let Some(pack) = &self.sealed {
            if pack.summary == summary {
                return Ok(pack.clone());
            }
            return Err(LedgerError::AlreadySealed {
                run_id: self.run_id.clone(),
            });
        }

        let entry_count = self.entries.len() as u64;
        let payload = AttestationPayload::for_summary(&summary, &self.head, entry_count)?;
        let bytes = payload.canonical_bytes()?;
        let signature = signer.sign(bytes.as_bytes())?;

        let mut steps = Vec::new();
        let mut approvals = Vec::new();
        for entry in &self.entries {
            match entry {
                LedgerEntry::Step(s) => steps.push(s.clone()),
                LedgerEntry::Approval(a) => approvals.push(a.clone()),
            }
        }

        let pack = EvidencePack {
            format_version: PACK_FORMAT_VERSION.to_string(),
            summary,
            steps,
            approvals,
            attestation: Attestation {
                final_hash: self.head.clone(),
                entry_count,
                payload_digest: hasher::digest(&bytes),
                signed_by: signer.signer_id().to_string(),
                signature,
                format_version: PACK_FORMAT_VERSION.to_string(),
            },
        };
        tracing::info!(
            run_id = %self.run_id,
            entries = entry_count,
            final_hash = %self.head,
            "evidence ledger sealed"
        );
        self.sealed = Some(pack.clone());
        Ok(pack)
    }
}

/// Recompute the chain over `entries` from the seed and return the final hash.
///
/// Entries must be in sequence order with indices `0..n`.
pub fn verify_entries(entries: &[LedgerEntry]) -> Result<String, LedgerError> {
    let mut head = hasher::chain_seed();
    for (index, entry) in entries.iter().enumerate() {
        let index = index as u64;
        if entry.seq() != index {
            return Err(LedgerError::ChainIntegrityViolation {
                seq: index,
                reason: format!("expected sequence index {index}, found {}", entry.seq()),
            });
        }
        let expected = hasher::chain_next(&head, &entry.canonical_bytes()?);
        if expected != entry.chain_hash() {
            return Err(LedgerError::ChainIntegrityViolation {
                seq: index,
                reason: format!(
                    "expected chain hash {expected}, recorded {}",
                    entry.chain_hash()
                ),
            });
        }
        head = expected;
    }
    Ok(head)
}
