//! ServiceNow REST connector
//!
//! Basic-auth access to the incident table with strict input validation
//! (record identifiers, numbers, dates) and a minimum interval between API
//! calls. Every query is parameterised; nothing is string-concatenated into
//! a URL.

use crate::config::ServiceNowConfig;
use crate::error::{IntegrationError, Result};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

fn sys_id_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-zA-Z0-9]{32}$").expect("static sys_id pattern"))
}

fn number_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Z]{2,3}[0-9]{8}$").expect("static number pattern"))
}

fn date_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^\d{4}-\d{2}-\d{2}([ T]\d{2}:\d{2}:\d{2})?$")
            .expect("static date pattern")
    })
}

/// Filters applied to an incident fetch
#[derive(Debug, Clone, Default)]
pub struct IncidentFilters {
    pub priority: Vec<String>,
    pub state: Vec<String>,
    pub updated_after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    #[serde(default)]
    result: Vec<serde_json::Value>,
}

/// Validated, rate-limited ServiceNow client
pub struct ServiceNowConnector {
    client: reqwest::Client,
    config: ServiceNowConfig,
    last_call: Mutex<Option<Instant>>,
}

impl ServiceNowConnector {
    pub fn new(config: ServiceNowConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            config,
            last_call: Mutex::new(None),
        }
    }

    fn table_url(&self) -> String {
        format!(
            "{}/api/now/table/incident",
            self.config.instance_url.trim_end_matches('/')
        )
    }

    /// Enforce the minimum gap between API calls
    async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        let gap = Duration::from_millis(self.config.min_api_interval_ms);
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < gap {
                sleep(gap - since).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Check the instance answers with valid credentials
    pub async fn test_connection(&self) -> bool {
        self.throttle().await;
        let result = self
            .client
            .get(self.table_url())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("sysparm_limit", "1")])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("ServiceNow connection test succeeded");
                true
            }
            Ok(response) => {
                warn!("ServiceNow connection test failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("ServiceNow connection test failed: {}", e);
                false
            }
        }
    }

    /// Fetch incidents matching the filters, paging up to `limit` records
    pub async fn get_incidents(
        &self,
        filters: &IncidentFilters,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let query = build_query(filters)?;
        let page_size = self.config.batch_size.max(1);
        let mut incidents = Vec::new();
        let mut offset = 0usize;

        while incidents.len() < limit {
            let fetch = page_size.min(limit - incidents.len());
            self.throttle().await;

            let limit_param = fetch.to_string();
            let offset_param = offset.to_string();
            let response = self
                .client
                .get(self.table_url())
                .basic_auth(&self.config.username, Some(&self.config.password))
                .query(&[
                    ("sysparm_query", query.as_str()),
                    ("sysparm_limit", limit_param.as_str()),
                    ("sysparm_offset", offset_param.as_str()),
                ])
                .send()
                .await
                .map_err(|e| IntegrationError::ConnectionFailed(e.to_string()))?;

            if response.status().as_u16() == 401 {
                return Err(
                    IntegrationError::AuthenticationFailed("bad credentials".to_string()).into(),
                );
            }
            if !response.status().is_success() {
                return Err(IntegrationError::ApiFailed(format!(
                    "status {}",
                    response.status()
                ))
                .into());
            }

            let page: TableResponse = response
                .json()
                .await
                .map_err(|e| IntegrationError::ApiFailed(e.to_string()))?;

            let count = page.result.len();
            incidents.extend(page.result);
            debug!("Fetched page of {} incidents (offset {})", count, offset);

            if count < fetch {
                break;
            }
            offset += count;
        }

        info!("Fetched {} incidents from ServiceNow", incidents.len());
        Ok(incidents)
    }

    /// Fetch a single incident by its 32-character sys_id
    pub async fn get_incident(&self, sys_id: &str) -> Result<serde_json::Value> {
        if !sys_id_regex().is_match(sys_id) {
            return Err(IntegrationError::InvalidIdentifier(sys_id.to_string()).into());
        }

        self.throttle().await;
        let url = format!("{}/{}", self.table_url(), sys_id);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| IntegrationError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(
                IntegrationError::ApiFailed(format!("status {}", response.status())).into(),
            );
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IntegrationError::ApiFailed(e.to_string()))?;
        body.get("result")
            .cloned()
            .ok_or_else(|| IntegrationError::ApiFailed("missing result".to_string()).into())
    }

    /// Validate an incident number like INC00012345
    pub fn validate_number(number: &str) -> bool {
        number_regex().is_match(number)
    }
}

/// Build a sysparm_query from validated filter values
fn build_query(filters: &IncidentFilters) -> Result<String> {
    let mut parts = Vec::new();

    if !filters.priority.is_empty() {
        for value in &filters.priority {
            if !value.chars().all(|c| c.is_ascii_digit()) {
                return Err(IntegrationError::InvalidIdentifier(format!(
                    "priority {}",
                    value
                ))
                .into());
            }
        }
        parts.push(format!("priorityIN{}", filters.priority.join(",")));
    }

    if !filters.state.is_empty() {
        for value in &filters.state {
            if !value.chars().all(|c| c.is_ascii_digit()) {
                return Err(
                    IntegrationError::InvalidIdentifier(format!("state {}", value)).into(),
                );
            }
        }
        parts.push(format!("stateIN{}", filters.state.join(",")));
    }

    if let Some(date) = &filters.updated_after {
        if !date_regex().is_match(date) {
            return Err(IntegrationError::InvalidIdentifier(format!("date {}", date)).into());
        }
        parts.push(format!("sys_updated_on>={}", date));
    }

    Ok(parts.join("^"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ServiceNowConfig {
        ServiceNowConfig {
            enabled: true,
            instance_url: url.to_string(),
            username: "svc".to_string(),
            password: "secret".to_string(),
            min_api_interval_ms: 0,
            batch_size: 2,
            ..ServiceNowConfig::default()
        }
    }

    #[test]
    fn test_identifier_validation() {
        assert!(sys_id_regex().is_match("a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4"));
        assert!(!sys_id_regex().is_match("short"));
        assert!(!sys_id_regex().is_match("a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d!"));

        assert!(ServiceNowConnector::validate_number("INC00012345"));
        assert!(!ServiceNowConnector::validate_number("INCX0012345"));
        assert!(!ServiceNowConnector::validate_number("inc00012345"));
    }

    #[test]
    fn test_build_query_validates_values() {
        let ok = build_query(&IncidentFilters {
            priority: vec!["1".to_string(), "2".to_string()],
            state: vec!["1".to_string()],
            updated_after: Some("2025-01-01 00:00:00".to_string()),
        })
        .unwrap();
        assert_eq!(
            ok,
            "priorityIN1,2^stateIN1^sys_updated_on>=2025-01-01 00:00:00"
        );

        let bad = build_query(&IncidentFilters {
            priority: vec!["1;DROP".to_string()],
            ..IncidentFilters::default()
        });
        assert!(bad.is_err());

        let bad_date = build_query(&IncidentFilters {
            updated_after: Some("not-a-date".to_string()),
            ..IncidentFilters::default()
        });
        assert!(bad_date.is_err());
    }

    #[tokio::test]
    async fn test_get_incidents_pages_until_short_page() {
        let server = MockServer::start().await;

        let incident = |n: u32| {
            json!({
                "sys_id": format!("{:032x}", n),
                "number": format!("INC{:08}", n),
                "short_description": "test"
            })
        };

        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .and(query_param("sysparm_offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [incident(1), incident(2)]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .and(query_param("sysparm_offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [incident(3)]
            })))
            .mount(&server)
            .await;

        let connector = ServiceNowConnector::new(config(&server.uri()));
        let incidents = connector
            .get_incidents(&IncidentFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(incidents.len(), 3);
        assert_eq!(incidents[2]["number"], "INC00000003");
    }

    #[tokio::test]
    async fn test_get_incident_rejects_bad_sys_id() {
        let connector = ServiceNowConnector::new(config("http://localhost:1"));
        let result = connector.get_incident("not-a-sys-id").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let connector = ServiceNowConnector::new(config(&server.uri()));
        let result = connector
            .get_incidents(&IncidentFilters::default(), 10)
            .await;
        assert!(result.is_err());
    }
}
