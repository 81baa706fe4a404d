// role.rs — Operator roles, ordered by authority.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Role of a human operator: `engineer < head < exec`.
///
/// A gate that requires a role is satisfied by that role or any higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Engineer,
    Head,
    Exec,
}

impl Role {
    /// Whether this role carries at least the authority of `required`.
    pub fn satisfies(&self, required: Role) -> bool {
        *self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Engineer => write!(f, "engineer"),
            Role::Head => write!(f, "head"),
            Role::Exec => write!(f, "exec"),
        }
    }
}

impl FromStr for Role {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "engineer" => Ok(Role::Engineer),
            "head" | "head_of_support" => Ok(Role::Head),
            "exec" | "executive" => Ok(Role::Exec),
            other => Err(PolicyError::Invalid {
                field: "role".to_string(),
                reason: format!("unknown role '{other}'"),
            }),
        }
    }
}
