//! Shared stub tool catalog for integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use spectra_orchestrator::models::{empty_object_schema, ToolDescriptor, ToolErrorKind, ToolFailure};
use spectra_orchestrator::tools::{ToolCallResult, ToolCatalog};
use spectra_orchestrator::error::OrchestrationError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
pub enum Behavior {
    Payload(Value),
    Slow(Duration, Value),
    Fail(ToolErrorKind),
}

/// Catalog that answers from canned behaviors and counts real invocations.
pub struct StubCatalog {
    tools: Vec<(ToolDescriptor, Behavior)>,
    healthy: AtomicBool,
    discovery_delay: Option<Duration>,
    calls: Mutex<HashMap<String, usize>>,
    log: Mutex<Vec<(String, Value)>>,
    completed: AtomicUsize,
}

impl StubCatalog {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            healthy: AtomicBool::new(true),
            discovery_delay: None,
            calls: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_tool(mut self, name: &str, behavior: Behavior) -> Self {
        self.tools.push((
            ToolDescriptor::new(name, format!("{} (stub)", name), empty_object_schema()),
            behavior,
        ));
        self
    }

    pub fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    /// `list_tools` sleeps this long before answering.
    pub fn stall_discovery(mut self, delay: Duration) -> Self {
        self.discovery_delay = Some(delay);
        self
    }

    /// Invocations that ran to the end, including ones nobody waited for.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Every real invocation, in the order it reached the catalog.
    pub fn log(&self) -> Vec<(String, Value)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ToolCatalog for StubCatalog {
    async fn health_check(&self) -> spectra_orchestrator::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestrationError::ToolCatalogUnreachable(
                "connection refused".to_string(),
            ))
        }
    }

    async fn list_tools(&self) -> spectra_orchestrator::Result<Vec<ToolDescriptor>> {
        if let Some(delay) = self.discovery_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.tools.iter().map(|(d, _)| d.clone()).collect())
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> ToolCallResult {
        *self.calls.lock().unwrap().entry(name.to_string()).or_insert(0) += 1;
        self.log
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));

        let behavior = self
            .tools
            .iter()
            .find(|(d, _)| d.name == name)
            .map(|(_, b)| b.clone());

        let result = match behavior {
            Some(Behavior::Payload(payload)) => Ok(payload),
            Some(Behavior::Slow(delay, payload)) => {
                tokio::time::sleep(delay).await;
                Ok(payload)
            }
            Some(Behavior::Fail(kind)) => Err(ToolFailure::new(kind, "stub failure")),
            None => Err(ToolFailure::new(ToolErrorKind::UnknownTool, name)),
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

pub fn alerts_payload() -> Value {
    json!({ "data": [
        { "id": "alert-1", "severity": "CRITICAL", "status": "NEW", "endpoint": "web-01" },
        { "id": "alert-2", "severity": "CRITICAL", "status": "NEW", "endpoint": "hr-laptop-7" },
        { "id": "alert-3", "severity": "CRITICAL", "status": "IN_PROGRESS", "endpoint": "db-02" }
    ]})
}

pub fn vulnerabilities_payload() -> Value {
    json!({ "data": [
        { "cve": "CVE-2024-3400", "severity": "CRITICAL", "status": "OPEN", "endpoint": "web-01" },
        { "cve": "CVE-2023-4966", "severity": "CRITICAL", "status": "OPEN", "endpoint": "db-02" },
        { "cve": "CVE-2024-21762", "severity": "CRITICAL", "status": "OPEN", "endpoint": "build-04" }
    ]})
}

pub fn security_catalog() -> StubCatalog {
    StubCatalog::new()
        .with_tool("list_alerts", Behavior::Payload(alerts_payload()))
        .with_tool("list_vulnerabilities", Behavior::Payload(vulnerabilities_payload()))
}
