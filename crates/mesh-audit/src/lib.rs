//! # mesh-audit
//!
//! Tamper-evident record of Agent Mesh runs.
//!
//! Every step and approval of a run is appended to an [`EvidenceLedger`],
//! where each entry's `chain_hash` is
//! `SHA-256(hex(previous hash) ∥ canonical bytes of the entry)`, rooted at a
//! fixed seed. Sealing a ledger produces an [`EvidencePack`] whose
//! [`Attestation`] binds the final hash, the entry count and the run summary,
//! signed by an external [`Signer`].
//!
//! The [`replay`] module re-verifies a pack from the seed and reconstructs
//! the sequence of states a run passed through, with no side effects.

pub mod canonical;
pub mod entry;
pub mod error;
pub mod hasher;
pub mod ledger;
pub mod pack;
pub mod replay;
pub mod signing;
pub mod state;

pub use canonical::CanonicalBytes;
pub use entry::{
    Approval, ApprovalDecision, ApprovalDraft, LedgerEntry, Step, StepDraft, StepKind,
    StepOutcome, ORCHESTRATOR,
};
pub use error::LedgerError;
pub use ledger::EvidenceLedger;
pub use pack::{Attestation, AttestationPayload, EvidencePack, RunSummary, PACK_FORMAT_VERSION};
pub use replay::{ReconstructedRunView, StateVisit, ToolCallSummary};
pub use signing::{verify_signature, LocalKeySigner, SignError, Signer};
pub use state::{FailureKind, RunState, StateTransition};
