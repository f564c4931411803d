//! Ticket processing: ServiceNow incident -> readable document
//!
//! Extracts the structured fields and technical details (IP addresses,
//! hostnames) into a text body suitable for chunking, plus a flat metadata
//! map and a content hash for change detection.

use crate::error::{IntegrationError, Result};
use crate::types::{content_hash, Metadata};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::debug;

fn ip_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static ip pattern")
    })
}

fn hostname_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\b[a-zA-Z][a-zA-Z0-9]*-[a-zA-Z0-9]+(?:-[a-zA-Z0-9]+)+\b")
            .expect("static hostname pattern")
    })
}

/// The fields whose changes mean a ticket needs re-ingestion
const HASHED_FIELDS: &[&str] = &[
    "number",
    "short_description",
    "description",
    "work_notes",
    "close_notes",
    "state",
    "priority",
    "assigned_to",
    "sys_updated_on",
];

/// A ticket transformed into document form
#[derive(Debug, Clone)]
pub struct ProcessedTicket {
    pub sys_id: String,
    pub number: String,
    pub title: String,
    pub text: String,
    pub metadata: Metadata,
    pub content_hash: String,
}

/// Turns raw incident records into ingestable documents
pub struct TicketProcessor;

impl TicketProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Hash the change-relevant fields of a raw incident
    pub fn content_hash(&self, incident: &serde_json::Value) -> String {
        let mut joined = String::new();
        for field in HASHED_FIELDS {
            joined.push_str(field_str(incident, field));
            joined.push('\x1f');
        }
        content_hash(joined.as_bytes())
    }

    /// Transform a raw incident into a readable document
    pub fn process(&self, incident: &serde_json::Value) -> Result<ProcessedTicket> {
        let sys_id = field_str(incident, "sys_id").to_string();
        let number = field_str(incident, "number").to_string();
        if sys_id.is_empty() || number.is_empty() {
            return Err(
                IntegrationError::InvalidIdentifier("incident missing sys_id/number".to_string())
                    .into(),
            );
        }

        let short_description = field_str(incident, "short_description");
        let description = field_str(incident, "description");
        let work_notes = field_str(incident, "work_notes");
        let priority = field_str(incident, "priority");
        let state = field_str(incident, "state");
        let category = field_str(incident, "category");
        let assigned_to = field_str(incident, "assigned_to");
        let opened_at = field_str(incident, "opened_at");
        let updated_at = field_str(incident, "sys_updated_on");

        let technical = extract_technical_details(&format!(
            "{} {} {}",
            short_description, description, work_notes
        ));

        let mut body = vec![
            format!("Incident Number: {}", number),
            format!("Priority: {}", priority_label(priority)),
            format!("State: {}", state_label(state)),
        ];
        if !category.is_empty() {
            body.push(format!("Category: {}", category));
        }
        if !assigned_to.is_empty() {
            body.push(format!("Assigned To: {}", assigned_to));
        }
        if !short_description.is_empty() {
            body.push(format!("Summary: {}", short_description));
        }
        if !description.is_empty() {
            body.push(format!("Description: {}", description));
        }
        if !work_notes.is_empty() {
            body.push(format!("Work Notes: {}", work_notes));
        }
        if !technical.ip_addresses.is_empty() {
            body.push(format!(
                "IP Addresses: {}",
                technical.ip_addresses.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if !technical.hostnames.is_empty() {
            body.push(format!(
                "Hostnames: {}",
                technical.hostnames.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }

        let mut metadata = Metadata::new();
        metadata.insert("sys_id".to_string(), json!(sys_id));
        metadata.insert("number".to_string(), json!(number));
        metadata.insert("priority".to_string(), json!(priority));
        metadata.insert("state".to_string(), json!(state));
        metadata.insert("source_type".to_string(), json!("ticket"));
        if !category.is_empty() {
            metadata.insert("category".to_string(), json!(category));
        }
        if !assigned_to.is_empty() {
            metadata.insert("author".to_string(), json!(assigned_to));
        }
        if !opened_at.is_empty() {
            metadata.insert("created_date".to_string(), json!(opened_at));
        }
        if !updated_at.is_empty() {
            metadata.insert("updated_at".to_string(), json!(updated_at));
        }

        debug!("Processed ticket {}", number);

        Ok(ProcessedTicket {
            content_hash: self.content_hash(incident),
            title: if short_description.is_empty() {
                number.clone()
            } else {
                short_description.to_string()
            },
            sys_id,
            number,
            text: body.join("\n"),
            metadata,
        })
    }
}

impl Default for TicketProcessor {
    fn default() -> Self {
        Self::new()
    }
}

struct TechnicalDetails {
    ip_addresses: BTreeSet<String>,
    hostnames: BTreeSet<String>,
}

fn extract_technical_details(text: &str) -> TechnicalDetails {
    let ip_addresses = ip_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    let hostnames = hostname_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    TechnicalDetails {
        ip_addresses,
        hostnames,
    }
}

fn field_str<'a>(incident: &'a serde_json::Value, field: &str) -> &'a str {
    incident.get(field).and_then(|v| v.as_str()).unwrap_or("")
}

fn priority_label(priority: &str) -> String {
    match priority {
        "1" => "1 - Critical".to_string(),
        "2" => "2 - High".to_string(),
        "3" => "3 - Moderate".to_string(),
        "4" => "4 - Low".to_string(),
        "5" => "5 - Planning".to_string(),
        other => other.to_string(),
    }
}

fn state_label(state: &str) -> String {
    match state {
        "1" => "New".to_string(),
        "2" => "In Progress".to_string(),
        "3" => "On Hold".to_string(),
        "6" => "Resolved".to_string(),
        "7" => "Closed".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn incident() -> serde_json::Value {
        json!({
            "sys_id": "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4",
            "number": "INC00010001",
            "short_description": "Core switch unreachable",
            "description": "Switch core-sw-01 at 10.20.30.40 stopped responding to pings.",
            "work_notes": "Rebooted via console on 10.20.30.41.",
            "priority": "1",
            "state": "2",
            "category": "network",
            "assigned_to": "Maria Garcia",
            "opened_at": "2025-12-03 08:15:00",
            "sys_updated_on": "2025-12-03 09:00:00"
        })
    }

    #[test]
    fn test_process_builds_readable_body() {
        let ticket = TicketProcessor::new().process(&incident()).unwrap();
        assert_eq!(ticket.number, "INC00010001");
        assert!(ticket.text.contains("Incident Number: INC00010001"));
        assert!(ticket.text.contains("Priority: 1 - Critical"));
        assert!(ticket.text.contains("State: In Progress"));
        assert!(ticket.text.contains("10.20.30.40"));
        assert!(ticket.text.contains("core-sw-01"));
        assert_eq!(ticket.metadata["source_type"], "ticket");
        assert_eq!(ticket.metadata["created_date"], "2025-12-03 08:15:00");
    }

    #[test]
    fn test_content_hash_tracks_changes() {
        let processor = TicketProcessor::new();
        let original = incident();
        let unchanged = incident();
        assert_eq!(
            processor.content_hash(&original),
            processor.content_hash(&unchanged)
        );

        let mut changed = incident();
        changed["work_notes"] = json!("Replaced the supervisor module.");
        assert_ne!(
            processor.content_hash(&original),
            processor.content_hash(&changed)
        );

        // Fields outside the hashed set do not trigger re-ingestion
        let mut cosmetic = incident();
        cosmetic["sys_mod_count"] = json!("17");
        assert_eq!(
            processor.content_hash(&original),
            processor.content_hash(&cosmetic)
        );
    }

    #[test]
    fn test_missing_identity_rejected() {
        let result = TicketProcessor::new().process(&json!({"short_description": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_technical_extraction() {
        let details =
            extract_technical_details("ap-bldg7-12 and rtr-edge-02 at 192.168.1.1 and 10.0.0.254");
        assert!(details.ip_addresses.contains("192.168.1.1"));
        assert!(details.ip_addresses.contains("10.0.0.254"));
        assert!(details.hostnames.contains("ap-bldg7-12"));
        assert!(details.hostnames.contains("rtr-edge-02"));
    }
}
