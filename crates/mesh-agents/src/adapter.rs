//! Agent adapter: the single, uniform way the mesh calls an agent tool.
//!
//! The adapter is purely a transport wrapper. It checks the tool against the
//! declared catalog, bounds the call with a timeout, and measures latency.
//! It never retries and never interprets policy; retry and gating belong to
//! the orchestrator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::catalog::{self, AgentCatalog, AgentKind, Tool};
use crate::error::{AgentError, ToolError};

/// Per-call timeout used when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pluggable transport to the underlying agent tools.
///
/// Production transports speak HTTP/MCP to the real agents; tests and demos
/// use [`SimulatedTransport`](crate::SimulatedTransport).
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Invoke `tool` on `agent` with an opaque JSON payload.
    async fn call(&self, agent: AgentKind, tool: Tool, input: &Value) -> Result<Value, ToolError>;
}

/// A resolved request to invoke one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub agent: AgentKind,
    pub tool: Tool,
    pub input: Value,
}

impl Invocation {
    /// Invocation addressed to the tool's owning agent.
    pub fn new(tool: Tool, input: Value) -> Self {
        Self {
            agent: tool.owner(),
            tool,
            input,
        }
    }

    /// Build an invocation from external string names.
    pub fn parse(agent: &str, tool: &str, input: Value) -> Result<Self, AgentError> {
        let (agent, tool) = catalog::resolve(agent, tool)?;
        Ok(Self { agent, tool, input })
    }
}

/// The observed result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub agent: AgentKind,
    pub tool: Tool,
    pub result: Result<Value, ToolError>,
    pub latency: Duration,
}

impl ToolCall {
    pub fn latency_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Invokes tools through a transport, bounded by a per-call timeout.
#[derive(Clone)]
pub struct AgentAdapter {
    transport: Arc<dyn AgentTransport>,
    catalog: AgentCatalog,
    call_timeout: Duration,
}

impl AgentAdapter {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            transport,
            catalog: AgentCatalog::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_catalog(mut self, catalog: AgentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Invoke one tool once.
    ///
    /// A tool the catalog does not declare is rejected without reaching the
    /// transport. A call that outlives the timeout is reported as
    /// [`ToolError::Unavailable`].
    pub async fn invoke(&self, invocation: &Invocation) -> ToolCall {
        let started = Instant::now();
        let result = if invocation.tool.owner() != invocation.agent
            || !self.catalog.declares(invocation.tool)
        {
            Err(ToolError::Rejected(format!(
                "tool '{}' is not declared by {}",
                invocation.tool, invocation.agent
            )))
        } else {
            match tokio::time::timeout(
                self.call_timeout,
                self.transport
                    .call(invocation.agent, invocation.tool, &invocation.input),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ToolError::Unavailable(format!(
                    "no response within {}ms",
                    self.call_timeout.as_millis()
                ))),
            }
        };
        let call = ToolCall {
            agent: invocation.agent,
            tool: invocation.tool,
            result,
            latency: started.elapsed(),
        };
        tracing::debug!(
            agent = %call.agent,
            tool = %call.tool,
            latency_ms = call.latency_ms(),
            ok = call.is_success(),
            "tool invoked"
        );
        call
    }
}

impl std::fmt::Debug for AgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAdapter")
            .field("catalog", &self.catalog)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AgentManifest;
    use crate::simulated::SimulatedTransport;
    use serde_json::json;

    #[tokio::test]
    async fn undeclared_tool_never_reaches_transport() {
        let transport = Arc::new(SimulatedTransport::new());
        let catalog = AgentCatalog::new(vec![AgentManifest {
            kind: AgentKind::TriageAgent,
            version: "2.1.3".into(),
            tools: vec![Tool::ClassifyTicket],
        }])
        .unwrap();
        let adapter = AgentAdapter::new(transport.clone()).with_catalog(catalog);

        let call = adapter
            .invoke(&Invocation::new(Tool::CreateIssue, json!({})))
            .await;
        assert!(matches!(call.result, Err(ToolError::Rejected(_))));
        assert_eq!(transport.calls(Tool::CreateIssue), 0);
    }

    #[tokio::test]
    async fn slow_call_times_out_as_unavailable() {
        let transport = Arc::new(
            SimulatedTransport::new().with_delay(Tool::ClassifyTicket, Duration::from_millis(200)),
        );
        let adapter =
            AgentAdapter::new(transport).with_call_timeout(Duration::from_millis(10));
        let call = adapter
            .invoke(&Invocation::new(
                Tool::ClassifyTicket,
                json!({"subject": "x", "body": "motor overheating"}),
            ))
            .await;
        match call.result {
            Err(e) => assert!(e.is_retryable()),
            Ok(v) => panic!("expected timeout, got {v}"),
        }
    }

    #[tokio::test]
    async fn injected_failure_is_returned_not_retried() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.fail_next(
            Tool::AnalyzeLog,
            1,
            ToolError::Unavailable("connection reset".into()),
        );
        let adapter = AgentAdapter::new(transport.clone());
        let call = adapter
            .invoke(&Invocation::new(
                Tool::AnalyzeLog,
                json!({"name": "a.log", "uri": "mem://a.log"}),
            ))
            .await;
        assert!(!call.is_success());
        assert_eq!(transport.calls(Tool::AnalyzeLog), 1);
    }

    #[test]
    fn parse_rejects_mismatched_pair() {
        assert!(Invocation::parse("LogAnalyzerAgent", "reserve_spare", json!({})).is_err());
        let inv = Invocation::parse("SpareAgent", "reserveSpare", json!({})).unwrap();
        assert_eq!(inv.agent, AgentKind::SpareAgent);
    }
}
