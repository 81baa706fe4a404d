// rate_limit.rs — Sliding-window cap on automatic irreversible actions.
//
// One limiter is shared by every run of a tenant. `try_consume` prunes,
// checks and records under a single lock, so two runs can never both take
// the last slot of a window.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use mesh_agents::Tool;
use serde::{Deserialize, Serialize};

/// Width of the sliding window.
pub const RATE_WINDOW: Duration = Duration::hours(1);

/// A class of automatic action counted against its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    AutoIssueCreate,
    AutoSpareReserve,
}

impl ActionClass {
    /// The rate-limited class of a tool, if it has one.
    pub fn for_tool(tool: Tool) -> Option<Self> {
        match tool {
            Tool::CreateIssue => Some(ActionClass::AutoIssueCreate),
            Tool::ReserveSpare => Some(ActionClass::AutoSpareReserve),
            _ => None,
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionClass::AutoIssueCreate => write!(f, "auto_issue_create"),
            ActionClass::AutoSpareReserve => write!(f, "auto_spare_reserve"),
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<ActionClass, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one slot now if fewer than `capacity` were used in the last hour.
    pub fn try_consume(&self, class: ActionClass, capacity: u32) -> bool {
        self.try_consume_at(class, capacity, Utc::now())
    }

    pub fn try_consume_at(&self, class: ActionClass, capacity: u32, now: DateTime<Utc>) -> bool {
        let mut windows = self.lock();
        let window = windows.entry(class).or_default();
        prune(window, now);
        if window.len() >= capacity as usize {
            tracing::warn!(%class, capacity, "automatic action rate limited");
            return false;
        }
        window.push_back(now);
        true
    }

    /// Slots used in the window ending at `now`.
    pub fn in_window(&self, class: ActionClass, now: DateTime<Utc>) -> usize {
        let mut windows = self.lock();
        let window = windows.entry(class).or_default();
        prune(window, now);
        window.len()
    }

    /// Earliest instant at which a slot frees up, or `None` if one is free now.
    pub fn next_available_at(
        &self,
        class: ActionClass,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut windows = self.lock();
        let window = windows.entry(class).or_default();
        prune(window, now);
        if window.len() < capacity as usize {
            return None;
        }
        // The slot that frees first belongs to the entry `capacity` places
        // from the newest.
        let index = window.len() - capacity as usize;
        window.get(index).map(|t| *t + RATE_WINDOW)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ActionClass, VecDeque<DateTime<Utc>>>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    while window.front().is_some_and(|t| now - *t >= RATE_WINDOW) {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn eleventh_consume_in_window_fails() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for i in 0..10 {
            assert!(limiter.try_consume_at(ActionClass::AutoIssueCreate, 10, now + Duration::seconds(i)));
        }
        assert!(!limiter.try_consume_at(ActionClass::AutoIssueCreate, 10, now + Duration::seconds(30)));
        assert_eq!(limiter.in_window(ActionClass::AutoIssueCreate, now + Duration::seconds(30)), 10);
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new();
        let t0 = Utc::now();
        assert!(limiter.try_consume_at(ActionClass::AutoIssueCreate, 1, t0));
        assert!(!limiter.try_consume_at(ActionClass::AutoIssueCreate, 1, t0 + Duration::minutes(59)));
        assert_eq!(
            limiter.next_available_at(ActionClass::AutoIssueCreate, 1, t0 + Duration::minutes(59)),
            Some(t0 + RATE_WINDOW)
        );
        assert!(limiter.try_consume_at(ActionClass::AutoIssueCreate, 1, t0 + RATE_WINDOW));
    }

    #[test]
    fn classes_have_separate_windows() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        assert!(limiter.try_consume_at(ActionClass::AutoIssueCreate, 1, now));
        assert!(limiter.try_consume_at(ActionClass::AutoSpareReserve, 1, now));
        assert_eq!(limiter.next_available_at(ActionClass::AutoSpareReserve, 2, now), None);
    }

    #[test]
    fn concurrent_consumers_never_exceed_capacity() {
        let limiter = Arc::new(RateLimiter::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .filter(|_| limiter.try_consume(ActionClass::AutoIssueCreate, 10))
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
    }

    #[test]
    fn only_irreversible_tools_are_limited() {
        assert_eq!(ActionClass::for_tool(Tool::CreateIssue), Some(ActionClass::AutoIssueCreate));
        assert_eq!(ActionClass::for_tool(Tool::AnalyzeLog), None);
    }
}
