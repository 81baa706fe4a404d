// error.rs — Error types for the policy subsystem.

use thiserror::Error;

use crate::role::Role;

/// Errors that can occur during policy administration.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The actor's role may not change the named setting.
    #[error("role '{role}' may not change '{field}' (requires {required})")]
    Forbidden {
        field: String,
        role: Role,
        required: Role,
    },

    /// A setting was given a value outside its valid range.
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// The requested policy version was never stored.
    #[error("policy version {0} not found")]
    UnknownVersion(u64),
}
