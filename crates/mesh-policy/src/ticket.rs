// ticket.rs — The support ticket a run resolves.
//
// A ticket is immutable once a run starts; corrections create a new run.

use std::fmt;
use std::str::FromStr;

use mesh_agents::Intent;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Ticket priority, P1 (most urgent) to P4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    /// Priority name used by the issue tracker.
    pub fn tracker_priority(&self) -> &'static str {
        match self {
            Priority::P1 => "Highest",
            Priority::P2 => "High",
            Priority::P3 => "Medium",
            Priority::P4 => "Low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for Priority {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            "P4" => Ok(Priority::P4),
            other => Err(PolicyError::Invalid {
                field: "priority".to_string(),
                reason: format!("unknown priority '{other}'"),
            }),
        }
    }
}

/// Flags raised by ingestion that force human review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFlags {
    #[serde(default)]
    pub contains_pii: bool,
    #[serde(default)]
    pub external_impact: bool,
}

/// A support ticket as delivered by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    /// Site code, e.g. `ATL-1`.
    pub site: String,
    #[serde(default = "default_tier")]
    pub customer_tier: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub priority: Priority,
    /// Intent declared by the customer, if any.
    #[serde(default)]
    pub intent: Option<Intent>,
    /// Ingestion confidence score in `[0, 1]`.
    #[serde(default = "default_score")]
    pub confidence: f64,
    /// Sentiment score in `[-1, 1]`.
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default)]
    pub policy_flags: PolicyFlags,
}

fn default_tier() -> String {
    "standard".to_string()
}

fn default_channel() -> String {
    "email".to_string()
}

fn default_score() -> f64 {
    1.0
}

impl Ticket {
    /// Minimal ticket; remaining fields take their defaults.
    pub fn new(
        id: impl Into<String>,
        body: impl Into<String>,
        site: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            subject: String::new(),
            body: body.into(),
            site: site.into(),
            customer_tier: default_tier(),
            channel: default_channel(),
            priority,
            intent: None,
            confidence: default_score(),
            sentiment: 0.0,
            policy_flags: PolicyFlags::default(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_flags(mut self, flags: PolicyFlags) -> Self {
        self.policy_flags = flags;
        self
    }

    /// Region code of the ticket's site (`ATL-1` → `ATL`).
    pub fn region(&self) -> &str {
        region_of(&self.site)
    }
}

/// Region code of a site or inventory location: the prefix before `-`.
pub fn region_of(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_prefix_before_dash() {
        assert_eq!(region_of("ATL-1"), "ATL");
        assert_eq!(region_of("DFW-DC"), "DFW");
        assert_eq!(region_of("HQ"), "HQ");
    }

    #[test]
    fn ticket_json_defaults() {
        let t: Ticket = serde_json::from_str(
            r#"{"id":"ZD-4821","body":"AGV misrouted totes","site":"ATL-1","priority":"P2"}"#,
        )
        .unwrap();
        assert_eq!(t.confidence, 1.0);
        assert!(!t.policy_flags.contains_pii);
        assert_eq!(t.region(), "ATL");
        assert_eq!(t.priority.tracker_priority(), "High");
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("p1".parse::<Priority>().unwrap(), Priority::P1);
        assert!("P9".parse::<Priority>().is_err());
    }
}
