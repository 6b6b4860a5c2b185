//! Query Classifier
//!
//! Assigns one of the specialist agent labels to a query:
//! - alert_triage, threat_hunt, vulnerability, asset_intel, posture: single domain
//! - correlation: questions spanning several data domains
//! - general: nothing specific matched
//!
//! The label is advisory. It only decides which tools are suggested to the
//! planner first; every tool in the catalog stays callable.

use crate::models::{Classification, Message, ToolDescriptor};
use crate::planner::Planner;
use tracing::{info, warn};

pub const GENERAL: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub preferred_tools: &'static [&'static str],
}

const ALERT_TOOLS: &[&str] = &[
    "get_alert",
    "list_alerts",
    "search_alerts",
    "get_alert_notes",
    "get_alert_history",
];

const HUNT_TOOLS: &[&str] = &[
    "purple_ai",
    "powerquery",
    "get_timestamp_range",
    "iso_to_unix_timestamp",
];

const VULNERABILITY_TOOLS: &[&str] = &[
    "get_vulnerability",
    "list_vulnerabilities",
    "search_vulnerabilities",
    "get_vulnerability_notes",
    "get_vulnerability_history",
];

const POSTURE_TOOLS: &[&str] = &[
    "get_misconfiguration",
    "list_misconfigurations",
    "search_misconfigurations",
    "get_misconfiguration_notes",
    "get_misconfiguration_history",
];

const ASSET_TOOLS: &[&str] = &[
    "get_inventory_item",
    "list_inventory_items",
    "search_inventory_items",
];

const CORRELATION_TOOLS: &[&str] = &[
    "list_alerts",
    "search_alerts",
    "list_vulnerabilities",
    "search_vulnerabilities",
    "list_misconfigurations",
    "list_inventory_items",
    "search_inventory_items",
    "purple_ai",
];

pub const AGENT_PROFILES: &[AgentProfile] = &[
    AgentProfile {
        name: "alert_triage",
        description: "Investigates security alerts and incidents: alert severity, detections, alert history, triage workflows.",
        preferred_tools: ALERT_TOOLS,
    },
    AgentProfile {
        name: "threat_hunt",
        description: "Threat hunting and telemetry: process activity, network connections, file operations, IOCs, lateral movement, PowerQueries.",
        preferred_tools: HUNT_TOOLS,
    },
    AgentProfile {
        name: "vulnerability",
        description: "Vulnerability management: CVEs, CVSS scores, exploitability, patch status per endpoint or application.",
        preferred_tools: VULNERABILITY_TOOLS,
    },
    AgentProfile {
        name: "asset_intel",
        description: "Asset inventory: endpoints, servers, devices, cloud resources, identities, agent versions.",
        preferred_tools: ASSET_TOOLS,
    },
    AgentProfile {
        name: "posture",
        description: "Cloud and Kubernetes misconfigurations, compliance, IAM issues, security benchmarks (CIS, NIST, SOC2).",
        preferred_tools: POSTURE_TOOLS,
    },
    AgentProfile {
        name: "correlation",
        description: "Cross-domain correlation and risk analysis spanning alerts, vulnerabilities, misconfigurations and inventory.",
        preferred_tools: CORRELATION_TOOLS,
    },
];

pub fn profile(name: &str) -> Option<&'static AgentProfile> {
    AGENT_PROFILES.iter().find(|p| p.name == name)
}

/// Tools suggested for a label. Composite labels (`a + b`) merge their profiles.
pub fn preferred_tools(label: &str) -> Vec<&'static str> {
    let mut tools = Vec::new();
    for part in label.split('+').map(str::trim) {
        if let Some(p) = profile(part) {
            for tool in p.preferred_tools {
                if !tools.contains(tool) {
                    tools.push(*tool);
                }
            }
        }
    }
    tools
}

const CORRELATION_KEYWORDS: &[&str] = &[
    "risk posture", "correlate", "correlation", "security overview", "comprehensive", "investigate",
];

const HUNT_KEYWORDS: &[&str] = &[
    "hunt", "hunting", "process", "network connection", "lateral movement", "persistence",
    "powerquery", "telemetry", "deep visibility", "purple ai", "endpoint activity",
    "file operation", "dns", "registry",
];

const ALERT_KEYWORDS: &[&str] = &[
    "alert", "incident", "detection", "threat",
];

const VULNERABILITY_KEYWORDS: &[&str] = &[
    "vulnerab", "cve", "patch", "exploit", "cvss",
];

const POSTURE_KEYWORDS: &[&str] = &[
    "misconfiguration", "misconfig", "compliance", "posture", "cloud security", "iam", "benchmark",
];

const ASSET_KEYWORDS: &[&str] = &[
    "inventory", "asset", "endpoint", "server", "device",
];

/// Static keyword router used when the reasoning engine cannot classify.
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn classify(query: &str) -> Classification {
        let text = query.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|kw| text.contains(kw));

        if has_any(CORRELATION_KEYWORDS) {
            return Classification::new("correlation", "Query asks for cross-domain correlation");
        }
        if has_any(HUNT_KEYWORDS) {
            return Classification::new("threat_hunt", "Query mentions telemetry or hunting terms");
        }

        // Several data domains in one question means correlation.
        let domains: Vec<&str> = [
            ("alert_triage", ALERT_KEYWORDS),
            ("vulnerability", VULNERABILITY_KEYWORDS),
            ("posture", POSTURE_KEYWORDS),
        ]
        .iter()
        .filter(|(_, keywords)| has_any(keywords))
        .map(|(name, _)| *name)
        .collect();

        if domains.len() >= 2 {
            return Classification::new(
                "correlation",
                format!("Query spans several domains: {}", domains.join(", ")),
            );
        }
        if let Some(domain) = domains.first() {
            return Classification::new(*domain, format!("Query matches {} keywords", domain));
        }
        if has_any(ASSET_KEYWORDS) {
            return Classification::new("asset_intel", "Query is about inventory or endpoints");
        }

        Classification::new(GENERAL, "No specialist keywords matched")
    }
}

/// Map free-form planner output onto known labels. Unknown names are matched
/// by substring; several valid names are joined with ` + `.
pub fn resolve_label(raw: &str) -> Option<String> {
    let cleaned = raw.trim().trim_matches(|c| c == '"' || c == '\'').to_lowercase();

    let mut labels: Vec<&'static str> = Vec::new();
    for part in cleaned.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let matched = if part == GENERAL {
            Some(GENERAL)
        } else if let Some(p) = profile(part) {
            Some(p.name)
        } else {
            AGENT_PROFILES
                .iter()
                .find(|p| part.contains(p.name))
                .map(|p| p.name)
        };
        if let Some(label) = matched {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
    }

    // `general` alongside a specialist adds nothing.
    if labels.len() > 1 {
        labels.retain(|l| *l != GENERAL);
    }

    if labels.is_empty() {
        None
    } else {
        Some(labels.join(" + "))
    }
}

/// Classify a turn. Never fails: planner errors degrade to `unclassified`.
pub async fn classify_turn(
    planner: &dyn Planner,
    query: &str,
    history: &[Message],
    tools: &[ToolDescriptor],
) -> Classification {
    match planner.classify(query, history, tools).await {
        Ok(raw) => match resolve_label(&raw.label) {
            Some(label) => {
                info!(label = %label, "Query classified");
                Classification::new(label, raw.rationale)
            }
            None => {
                let fallback = KeywordClassifier::classify(query);
                info!(
                    raw = %raw.label,
                    label = %fallback.label,
                    "Planner label not recognised, using keyword routing"
                );
                fallback
            }
        },
        Err(e) => {
            let hint = KeywordClassifier::classify(query);
            warn!(error = %e, "Classification failed; continuing unclassified");
            Classification::unclassified(format!(
                "Classifier unavailable; keyword routing suggests {}",
                hint.label
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_domain_queries() {
        let cases = vec![
            ("show critical alerts from today", "alert_triage"),
            ("list CVEs with CVSS above 9", "vulnerability"),
            ("AWS IAM misconfigurations", "posture"),
            ("find all Windows servers", "asset_intel"),
            ("hunt for lateral movement on web-01", "threat_hunt"),
        ];

        for (query, expected) in cases {
            assert_eq!(KeywordClassifier::classify(query).label, expected, "{}", query);
        }
    }

    #[test]
    fn test_cross_domain_is_correlation() {
        let c = KeywordClassifier::classify(
            "Which endpoints have both active critical alerts AND unpatched critical vulnerabilities?",
        );
        assert_eq!(c.label, "correlation");

        let c = KeywordClassifier::classify("give me a security overview");
        assert_eq!(c.label, "correlation");
    }

    #[test]
    fn test_general_fallback() {
        assert_eq!(KeywordClassifier::classify("hi").label, GENERAL);
    }

    #[test]
    fn test_resolve_label() {
        assert_eq!(resolve_label("\"alert_triage\"").as_deref(), Some("alert_triage"));
        assert_eq!(
            resolve_label("alert_triage, vulnerability").as_deref(),
            Some("alert_triage + vulnerability")
        );
        assert_eq!(resolve_label("the correlation agent").as_deref(), Some("correlation"));
        assert_eq!(resolve_label("general").as_deref(), Some(GENERAL));
        assert!(resolve_label("banana").is_none());
    }

    #[test]
    fn test_preferred_tools_merge() {
        let tools = preferred_tools("alert_triage + vulnerability");
        assert!(tools.contains(&"list_alerts"));
        assert!(tools.contains(&"list_vulnerabilities"));
        assert!(preferred_tools(GENERAL).is_empty());
    }
}
