//! In-process turn metrics
//!
//! Per-tool and per-agent call counts, error counts and latency, plus how
//! turns were routed. Served at `GET /api/metrics`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default, Clone)]
struct CallStats {
    call_count: u64,
    error_count: u64,
    total_latency_ms: u64,
}

impl CallStats {
    fn record(&mut self, latency_ms: u64, error: bool) {
        self.call_count += 1;
        self.total_latency_ms += latency_ms;
        if error {
            self.error_count += 1;
        }
    }

    fn report(&self, name: &str) -> CallReport {
        let calls = self.call_count.max(1) as f64;
        CallReport {
            name: name.to_string(),
            call_count: self.call_count,
            error_count: self.error_count,
            error_rate: round_to(self.error_count as f64 / calls, 4),
            avg_latency_ms: round_to(self.total_latency_ms as f64 / calls, 1),
            total_latency_ms: self.total_latency_ms,
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallReport {
    pub name: String,
    pub call_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub total_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutingReport {
    pub total_queries: u64,
    pub multi_agent_queries: u64,
    pub multi_agent_rate: f64,
    pub routing_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub agents: BTreeMap<String, CallReport>,
    pub tools: BTreeMap<String, CallReport>,
    pub orchestrator: RoutingReport,
}

#[derive(Debug, Default)]
struct Inner {
    agents: BTreeMap<String, CallStats>,
    tools: BTreeMap<String, CallStats>,
    total_queries: u64,
    multi_agent_queries: u64,
    routing: BTreeMap<String, u64>,
}

/// Shared between the orchestrator, its executor and the API.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters stay usable even if a recording thread panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One real invocation against the catalog.
    pub fn record_tool_call(&self, tool: &str, latency_ms: u64, error: bool) {
        self.lock()
            .tools
            .entry(tool.to_string())
            .or_default()
            .record(latency_ms, error);
    }

    /// One finished or failed turn, attributed to its classification label.
    pub fn record_agent_call(&self, agent: &str, latency_ms: u64, error: bool) {
        self.lock()
            .agents
            .entry(agent.to_string())
            .or_default()
            .record(latency_ms, error);
    }

    /// Composite labels (`a + b`) count as multi-agent.
    pub fn record_routing(&self, label: &str) {
        let mut inner = self.lock();
        inner.total_queries += 1;
        if label.contains(" + ") {
            inner.multi_agent_queries += 1;
        }
        *inner.routing.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let reports = |stats: &BTreeMap<String, CallStats>| {
            stats
                .iter()
                .map(|(name, s)| (name.clone(), s.report(name)))
                .collect()
        };
        let multi_agent_rate = if inner.total_queries == 0 {
            0.0
        } else {
            round_to(inner.multi_agent_queries as f64 / inner.total_queries as f64, 4)
        };

        MetricsSnapshot {
            agents: reports(&inner.agents),
            tools: reports(&inner.tools),
            orchestrator: RoutingReport {
                total_queries: inner.total_queries,
                multi_agent_queries: inner.multi_agent_queries,
                multi_agent_rate,
                routing_distribution: inner.routing.clone(),
            },
        }
    }

    pub fn reset(&self) {
        *self.lock() = Inner::default();
    }
}
