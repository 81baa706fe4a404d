// simulated.rs — Deterministic in-process agent tools.
//
// Reproduces the demo behavior of the three agents without a network:
// keyword triage, sequential tracker keys, error-signature log analysis,
// and a small spare-parts inventory. Failure injection and per-tool call
// counters make it the transport of choice for orchestration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::AgentTransport;
use crate::catalog::{AgentKind, Tool};
use crate::error::ToolError;
use crate::payload::{
    ArtifactRef, Classification, Intent, IssueRef, IssueRequest, LogFindings, Reservation,
    ReserveRequest, SpareRecommendation, SpareRequest, Track,
};

const HARDWARE_KEYWORDS: &[&str] = &[
    "firmware", "totes", "misrouted", "sensor", "charging", "agv", "dock", "motor", "driver",
    "board",
];
const SOFTWARE_KEYWORDS: &[&str] = &[
    "api",
    "interface",
    "login",
    "export",
    "report",
    "dashboard",
    "configuration",
];

const FIRST_ISSUE_NUMBER: u64 = 1012;

/// One stock line in the simulated inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub part_no: String,
    pub name: String,
    pub location: String,
    pub quantity: u32,
    pub unit_value_cents: u64,
}

impl InventoryItem {
    pub fn new(
        part_no: &str,
        name: &str,
        location: &str,
        quantity: u32,
        unit_value_cents: u64,
    ) -> Self {
        Self {
            part_no: part_no.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            quantity,
            unit_value_cents,
        }
    }
}

fn default_inventory() -> Vec<InventoryItem> {
    vec![
        InventoryItem::new("MD-BRD-V2", "Motor driver board v2", "DFW-DC", 5, 60_000),
        InventoryItem::new("MD-BRD-V2", "Motor driver board v2", "LHR-DC", 2, 60_000),
        InventoryItem::new("SENSOR-BATT-A1", "Battery sensor A1", "ATL-DC", 12, 8_500),
        InventoryItem::new("CHG-DOCK-C3", "Charging dock contact set", "ATL-DC", 4, 12_000),
    ]
}

struct Signature {
    name: &'static str,
    pattern: Regex,
    root_cause: &'static str,
    action: &'static str,
    replacement_part: Option<&'static str>,
    confidence: f64,
}

fn signatures() -> &'static [Signature] {
    static SIGNATURES: OnceLock<Vec<Signature>> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        [
            (
                "crc_mismatch",
                r"(?i)CRC.*mismatch.*error",
                "CRC mismatch errors on the motor driver bus",
                "hardware_replacement",
                Some("MD-BRD-V2"),
                0.92,
            ),
            (
                "connection_timeout",
                r"(?i)timeout.*connection.*failed",
                "repeated connection timeouts to upstream services",
                "network_investigation",
                None,
                0.78,
            ),
            (
                "memory_exhaustion",
                r"OutOfMemoryError|(?i:memory.*leak)",
                "process memory exhaustion",
                "restart_service",
                None,
                0.85,
            ),
        ]
        .into_iter()
        .filter_map(|(name, pattern, root_cause, action, replacement_part, confidence)| {
            Regex::new(pattern).ok().map(|pattern| Signature {
                name,
                pattern,
                root_cause,
                action,
                replacement_part,
                confidence,
            })
        })
        .collect()
    })
}

fn timestamp_pattern() -> Option<&'static Regex> {
    static TIMESTAMP: OnceLock<Option<Regex>> = OnceLock::new();
    TIMESTAMP
        .get_or_init(|| Regex::new(r"\b(\d{2}:\d{2}:\d{2})\b").ok())
        .as_ref()
}

#[derive(Default)]
struct State {
    calls: HashMap<Tool, u64>,
    failures: HashMap<Tool, VecDeque<ToolError>>,
    delays: HashMap<Tool, Duration>,
    logs: HashMap<String, String>,
    inventory: Vec<InventoryItem>,
    issues: HashMap<String, IssueRef>,
    reservations: HashMap<String, Reservation>,
    issues_created: u64,
    reservations_made: u64,
}

/// Deterministic implementation of all five tools.
pub struct SimulatedTransport {
    state: Mutex<State>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                inventory: default_inventory(),
                ..State::default()
            }),
        }
    }

    /// Replace the inventory table.
    pub fn with_inventory(self, inventory: Vec<InventoryItem>) -> Self {
        self.lock().inventory = inventory;
        self
    }

    /// Register in-memory log content addressed by `uri`.
    pub fn with_log(self, uri: impl Into<String>, content: impl Into<String>) -> Self {
        self.lock().logs.insert(uri.into(), content.into());
        self
    }

    /// Delay every call to `tool` (used to exercise the adapter timeout).
    pub fn with_delay(self, tool: Tool, delay: Duration) -> Self {
        self.lock().delays.insert(tool, delay);
        self
    }

    /// Make the next `times` calls to `tool` fail with `error`.
    pub fn fail_next(&self, tool: Tool, times: usize, error: ToolError) {
        let mut state = self.lock();
        let queue = state.failures.entry(tool).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Number of calls that reached this transport for `tool`.
    pub fn calls(&self, tool: Tool) -> u64 {
        self.lock().calls.get(&tool).copied().unwrap_or(0)
    }

    /// Remaining stock of `part_no` at `location`.
    pub fn stock(&self, part_no: &str, location: &str) -> u32 {
        self.lock()
            .inventory
            .iter()
            .find(|i| i.part_no == part_no && i.location == location)
            .map(|i| i.quantity)
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn classify(&self, input: &Value) -> Result<Value, ToolError> {
        let text = [input.get("subject"), input.get("body")]
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let hits = |keywords: &[&str]| -> Vec<String> {
            keywords
                .iter()
                .filter(|k| words.contains(*k))
                .map(|k| k.to_string())
                .collect()
        };
        let hardware = hits(HARDWARE_KEYWORDS);
        let software = hits(SOFTWARE_KEYWORDS);
        let (track, matched) = if hardware.len() >= software.len() && !hardware.is_empty() {
            (Track::Hardware, hardware)
        } else {
            (Track::Software, software)
        };

        let confidence = input
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| (0.5 + 0.1 * matched.len() as f64).min(0.95));
        let intent = input
            .get("intent")
            .cloned()
            .and_then(|v| serde_json::from_value::<Intent>(v).ok())
            .unwrap_or(match input.get("priority").and_then(Value::as_str) {
                Some("P1") => Intent::Incident,
                _ => Intent::Bug,
            });
        let rationale = if matched.is_empty() {
            "no track keywords found; defaulting to software".to_string()
        } else {
            format!("{} keywords indicate {track} issue", matched.join(", "))
        };
        let similar_tickets = input
            .get("similar_tickets")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        encode(&Classification {
            track,
            intent,
            confidence,
            rationale,
            similar_tickets,
        })
    }

    fn create_issue(&self, input: &Value) -> Result<Value, ToolError> {
        let request: IssueRequest = decode(input)?;
        let mut state = self.lock();
        if let Some(existing) = state.issues.get(&request.idempotency_key) {
            return encode(existing);
        }
        let key = format!("GO-{}", FIRST_ISSUE_NUMBER + state.issues_created);
        state.issues_created += 1;
        let issue = IssueRef {
            url: format!("https://tracker.example.com/browse/{key}"),
            project: "GO".to_string(),
            key,
        };
        state.issues.insert(request.idempotency_key, issue.clone());
        encode(&issue)
    }

    async fn analyze_log(&self, input: &Value) -> Result<Value, ToolError> {
        let artifact: ArtifactRef = decode(input)?;
        let in_memory = self.lock().logs.get(&artifact.uri).cloned();
        let content = match in_memory {
            Some(content) => content,
            None => {
                let path = artifact.uri.strip_prefix("file://").unwrap_or(&artifact.uri);
                tokio::fs::read_to_string(path).await.map_err(|e| {
                    ToolError::Rejected(format!("cannot read artifact '{}': {e}", artifact.uri))
                })?
            }
        };

        let matched: Vec<&Signature> = signatures()
            .iter()
            .filter(|s| s.pattern.is_match(&content))
            .collect();
        let findings = match matched.first() {
            Some(primary) => LogFindings {
                root_cause: primary.root_cause.to_string(),
                signals: matched.iter().map(|s| s.name.to_string()).collect(),
                error_bursts: content
                    .lines()
                    .filter(|line| primary.pattern.is_match(line))
                    .filter_map(|line| {
                        timestamp_pattern()
                            .and_then(|re| re.captures(line))
                            .map(|c| c[1].to_string())
                    })
                    .collect(),
                recommended_action: primary.action.to_string(),
                replacement_part: primary.replacement_part.map(String::from),
                confidence: primary.confidence,
            },
            None => LogFindings {
                root_cause: "no known error signature".to_string(),
                signals: Vec::new(),
                error_bursts: Vec::new(),
                recommended_action: "monitor".to_string(),
                replacement_part: None,
                confidence: 0.4,
            },
        };
        encode(&findings)
    }

    fn recommend_spare(&self, input: &Value) -> Result<Value, ToolError> {
        let request: SpareRequest = decode(input)?;
        let site_region = region(&request.site);
        let state = self.lock();
        let mut candidates: Vec<&InventoryItem> = state
            .inventory
            .iter()
            .filter(|i| i.part_no == request.part_no && i.quantity > 0)
            .collect();
        // Same-region stock first, then the deepest stock.
        candidates.sort_by_key(|i| (region(&i.location) != site_region, std::cmp::Reverse(i.quantity)));
        let item = candidates.first().ok_or_else(|| {
            ToolError::Rejected(format!("no stock available for part '{}'", request.part_no))
        })?;
        let eta = if region(&item.location) == site_region {
            "1-2 business days"
        } else {
            "3-5 business days"
        };
        encode(&SpareRecommendation {
            part_no: item.part_no.clone(),
            name: item.name.clone(),
            location: item.location.clone(),
            quantity: 1,
            unit_value_cents: item.unit_value_cents,
            eta: eta.to_string(),
        })
    }

    fn reserve_spare(&self, input: &Value) -> Result<Value, ToolError> {
        let request: ReserveRequest = decode(input)?;
        if request.quantity == 0 {
            return Err(ToolError::Rejected("quantity must be positive".into()));
        }
        let mut state = self.lock();
        if let Some(existing) = state.reservations.get(&request.idempotency_key) {
            return encode(existing);
        }
        let item = state
            .inventory
            .iter_mut()
            .find(|i| i.part_no == request.part_no && i.location == request.location)
            .ok_or_else(|| {
                ToolError::Rejected(format!(
                    "part '{}' is not stocked at {}",
                    request.part_no, request.location
                ))
            })?;
        if item.quantity < request.quantity {
            return Err(ToolError::Rejected(format!(
                "insufficient stock: {} requested, {} on hand",
                request.quantity, item.quantity
            )));
        }
        item.quantity -= request.quantity;
        let value_cents = item
            .unit_value_cents
            .saturating_mul(u64::from(request.quantity));
        state.reservations_made += 1;
        let reservation = Reservation {
            part_no: request.part_no,
            location: request.location,
            quantity: request.quantity,
            value_cents,
            confirmation_id: format!("RSV-{:06}", state.reservations_made),
        };
        state
            .reservations
            .insert(request.idempotency_key, reservation.clone());
        encode(&reservation)
    }
}

#[async_trait]
impl AgentTransport for SimulatedTransport {
    async fn call(&self, agent: AgentKind, tool: Tool, input: &Value) -> Result<Value, ToolError> {
        if tool.owner() != agent {
            return Err(ToolError::Rejected(format!("{agent} does not expose {tool}")));
        }
        let (delay, injected) = {
            let mut state = self.lock();
            *state.calls.entry(tool).or_insert(0) += 1;
            let injected = state.failures.get_mut(&tool).and_then(VecDeque::pop_front);
            (state.delays.get(&tool).copied(), injected)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = injected {
            return Err(error);
        }
        match tool {
            Tool::ClassifyTicket => self.classify(input),
            Tool::CreateIssue => self.create_issue(input),
            Tool::AnalyzeLog => self.analyze_log(input).await,
            Tool::RecommendSpare => self.recommend_spare(input),
            Tool::ReserveSpare => self.reserve_spare(input),
        }
    }
}

/// Region code of a site or location (`ATL-1` → `ATL`).
fn region(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

fn decode<T: DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    T::deserialize(input).map_err(|e| ToolError::Rejected(format!("malformed input: {e}")))
}

fn encode<T: Serialize>(output: &T) -> Result<Value, ToolError> {
    serde_json::to_value(output).map_err(|e| ToolError::Rejected(format!("malformed output: {e}")))
}
