// config.rs — Governance configuration and partial updates to it.
//
// The Agentfile spells these keys in camelCase (`p1NeedsApproval`); both
// spellings are accepted on input, snake_case is written on output.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::role::Role;

/// Versioned governance options. Runs read an immutable snapshot of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Monotonic version, bumped by every administrative update.
    pub version: u64,

    /// P1 tickets need approval before a tracking issue is created.
    #[serde(alias = "p1NeedsApproval")]
    pub p1_needs_approval: bool,

    /// Tickets flagged as containing PII need approval for every action.
    #[serde(alias = "containsPiiApproval")]
    pub pii_approval_required: bool,

    /// Tickets flagged with external impact need approval for every action.
    #[serde(alias = "externalImpactApproval")]
    pub external_impact_approval_required: bool,

    /// Actions triggered by a lower confidence than this need approval.
    #[serde(alias = "confidenceThreshold")]
    pub confidence_threshold: f64,

    /// Capacity of each automatic-action class per rolling hour.
    #[serde(alias = "maxAutoCreatesPerHour")]
    pub max_auto_creates_per_hour: u32,

    /// Elevated governance: costly or cross-site reservations need an exec.
    #[serde(alias = "strictMode")]
    pub strict_mode: bool,

    /// Reservation value (cents) above which strict mode requires approval.
    #[serde(alias = "strictModeThresholdCents")]
    pub strict_mode_threshold_cents: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: 1,
            p1_needs_approval: true,
            pii_approval_required: true,
            external_impact_approval_required: false,
            confidence_threshold: 0.8,
            max_auto_creates_per_hour: 10,
            strict_mode: false,
            strict_mode_threshold_cents: 50_000,
        }
    }
}

impl PolicyConfig {
    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PolicyError::Invalid {
                field: "confidence_threshold".to_string(),
                reason: format!("{} is outside [0, 1]", self.confidence_threshold),
            });
        }
        if self.max_auto_creates_per_hour == 0 {
            return Err(PolicyError::Invalid {
                field: "max_auto_creates_per_hour".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Produce the next version of this config with `patch` applied.
    ///
    /// Strict-mode settings may only be changed by an exec. The result is
    /// validated before it is returned.
    pub fn apply(&self, patch: &PolicyPatch, actor: Role) -> Result<PolicyConfig, PolicyError> {
        let strict_fields = [
            (
                "strict_mode",
                patch.strict_mode.is_some_and(|v| v != self.strict_mode),
            ),
            (
                "strict_mode_threshold_cents",
                patch
                    .strict_mode_threshold_cents
                    .is_some_and(|v| v != self.strict_mode_threshold_cents),
            ),
        ];
        for (field, changed) in strict_fields {
            if changed && !actor.satisfies(Role::Exec) {
                return Err(PolicyError::Forbidden {
                    field: field.to_string(),
                    role: actor,
                    required: Role::Exec,
                });
            }
        }

        let next = PolicyConfig {
            version: self.version + 1,
            p1_needs_approval: patch.p1_needs_approval.unwrap_or(self.p1_needs_approval),
            pii_approval_required: patch
                .pii_approval_required
                .unwrap_or(self.pii_approval_required),
            external_impact_approval_required: patch
                .external_impact_approval_required
                .unwrap_or(self.external_impact_approval_required),
            confidence_threshold: patch
                .confidence_threshold
                .unwrap_or(self.confidence_threshold),
            max_auto_creates_per_hour: patch
                .max_auto_creates_per_hour
                .unwrap_or(self.max_auto_creates_per_hour),
            strict_mode: patch.strict_mode.unwrap_or(self.strict_mode),
            strict_mode_threshold_cents: patch
                .strict_mode_threshold_cents
                .unwrap_or(self.strict_mode_threshold_cents),
        };
        next.validate()?;
        Ok(next)
    }
}

/// A partial update submitted through the administrative interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyPatch {
    pub p1_needs_approval: Option<bool>,
    pub pii_approval_required: Option<bool>,
    pub external_impact_approval_required: Option<bool>,
    pub confidence_threshold: Option<f64>,
    pub max_auto_creates_per_hour: Option<u32>,
    pub strict_mode: Option<bool>,
    pub strict_mode_threshold_cents: Option<u64>,
}
