//! External-source scheduler tests against a mocked ServiceNow instance

mod common;

use common::{test_config, test_system};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn incident(n: u32) -> serde_json::Value {
    json!({
        "sys_id": format!("{:032x}", n),
        "number": format!("INC{:08}", n),
        "short_description": format!("Outage {} on access switch", n),
        "description": format!("Switch core-sw-{:02} at 10.0.0.{} is unreachable.", n, n),
        "priority": "2",
        "state": "2",
        "category": "network",
        "opened_at": "2025-12-01 08:00:00",
        "sys_updated_on": "2025-12-01 09:00:00"
    })
}

async fn mock_instance(incidents: Vec<serde_json::Value>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/now/table/incident"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": incidents })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_two_polls_with_unchanged_tickets_are_idempotent() {
    let incidents: Vec<_> = (1..=10).map(incident).collect();
    let server = mock_instance(incidents).await;

    let mut config = test_config();
    config.servicenow.enabled = true;
    config.servicenow.instance_url = server.uri();
    config.servicenow.username = "svc".to_string();
    config.servicenow.password = "secret".to_string();
    config.servicenow.min_api_interval_ms = 0;
    let system = test_system(config).await;

    let first = system.sync_servicenow().await.unwrap();
    assert_eq!(first.incidents_fetched, 10);
    assert_eq!(first.new_incidents, 10);
    assert_eq!(first.updated_incidents, 0);
    assert_eq!(first.incidents_ingested, 10);
    assert!(first.errors.is_empty());

    let after_first = system.stats().await.unwrap();
    assert_eq!(after_first.documents, 10);
    assert!(after_first.vectors >= 10);

    // Second poll sees identical content hashes and writes nothing
    let second = system.sync_servicenow().await.unwrap();
    assert_eq!(second.incidents_fetched, 10);
    assert_eq!(second.new_incidents, 0);
    assert_eq!(second.updated_incidents, 0);
    assert_eq!(second.incidents_ingested, 0);

    let after_second = system.stats().await.unwrap();
    assert_eq!(after_second.documents, after_first.documents);
    assert_eq!(after_second.vectors, after_first.vectors);
}

#[tokio::test]
async fn test_changed_ticket_is_reingested() {
    let server = MockServer::start().await;
    let system = {
        let mut config = test_config();
        config.servicenow.enabled = true;
        config.servicenow.instance_url = server.uri();
        config.servicenow.username = "svc".to_string();
        config.servicenow.password = "secret".to_string();
        config.servicenow.min_api_interval_ms = 0;
        test_system(config).await
    };

    let first_mock = Mock::given(method("GET"))
        .and(path("/api/now/table/incident"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "result": [incident(1)] })),
        )
        .expect(1..);
    server.register(first_mock).await;

    let first = system.sync_servicenow().await.unwrap();
    assert_eq!(first.new_incidents, 1);

    // The same ticket comes back with new work notes
    server.reset().await;
    let mut changed = incident(1);
    changed["work_notes"] = json!("Replaced the uplink module.");
    changed["sys_updated_on"] = json!("2025-12-02 10:00:00");
    Mock::given(method("GET"))
        .and(path("/api/now/table/incident"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [changed] })))
        .mount(&server)
        .await;

    let second = system.sync_servicenow().await.unwrap();
    assert_eq!(second.new_incidents, 0);
    assert_eq!(second.updated_incidents, 1);

    // Still one document: the revision replaced the original
    let stats = system.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
}

#[tokio::test]
async fn test_failed_poll_is_recorded_and_non_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/now/table/incident"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.servicenow.enabled = true;
    config.servicenow.instance_url = server.uri();
    config.servicenow.username = "svc".to_string();
    config.servicenow.password = "secret".to_string();
    config.servicenow.min_api_interval_ms = 0;
    let system = test_system(config).await;

    let outcome = system.sync_servicenow().await.unwrap();
    assert_eq!(outcome.incidents_fetched, 0);
    assert!(!outcome.errors.is_empty());

    // The system is still usable afterwards
    let stats = system.stats().await.unwrap();
    assert_eq!(stats.documents, 0);
}
