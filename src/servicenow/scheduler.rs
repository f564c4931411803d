//! Periodic ServiceNow fetch with change-detection caching
//!
//! Each tick builds the configured filter set, pages through incidents up
//! to the per-fetch cap, skips records whose content hash is unchanged in
//! the cache, and feeds new or changed tickets through the ingestion
//! engine. Every tick is recorded in `fetch_history`; a failed poll is
//! recorded and the scheduler keeps running.

use crate::config::ServiceNowConfig;
use crate::error::Result;
use crate::ingestion::{IngestStatus, IngestionEngine};
use crate::metadata_store::{MetadataStore, COLLECTION_FETCH_HISTORY, COLLECTION_TICKETS_CACHE};
use crate::servicenow::connector::{IncidentFilters, ServiceNowConnector};
use crate::servicenow::processor::TicketProcessor;
use crate::types::SourceType;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Grace period for an in-flight fetch to drain on stop
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Outcome of one fetch tick, persisted to `fetch_history`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub id: String,
    pub fetch_time: String,
    pub incidents_fetched: usize,
    pub incidents_processed: usize,
    pub incidents_ingested: usize,
    pub new_incidents: usize,
    pub updated_incidents: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

/// Scheduler driving periodic incident ingestion
pub struct TicketScheduler {
    connector: ServiceNowConnector,
    processor: TicketProcessor,
    engine: Arc<IngestionEngine>,
    metadata_store: Arc<MetadataStore>,
    config: ServiceNowConfig,
    running: AtomicBool,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TicketScheduler {
    pub fn new(
        engine: Arc<IngestionEngine>,
        metadata_store: Arc<MetadataStore>,
        config: ServiceNowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector: ServiceNowConnector::new(config.clone()),
            processor: TicketProcessor::new(),
            engine,
            metadata_store,
            config,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
        })
    }

    /// Start the periodic tick loop; a second start is a no-op
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        let scheduler = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(scheduler.config.fetch_interval_minutes * 60);
            info!(
                "ServiceNow scheduler started (interval {} min)",
                scheduler.config.fetch_interval_minutes
            );

            loop {
                let outcome = scheduler.fetch_and_process().await;
                if !outcome.errors.is_empty() {
                    warn!("Fetch tick finished with {} error(s)", outcome.errors.len());
                }

                tokio::select! {
                    _ = scheduler.shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            info!("ServiceNow scheduler loop exited");
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Stop the loop, letting an in-flight fetch drain within the grace
    /// period
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                error!("Scheduler did not drain within grace period");
            }
        }
        info!("ServiceNow scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one fetch cycle synchronously (manual sync)
    pub async fn sync_now(&self) -> FetchOutcome {
        self.fetch_and_process().await
    }

    async fn fetch_and_process(&self) -> FetchOutcome {
        let started = std::time::Instant::now();
        let mut outcome = FetchOutcome {
            id: Uuid::new_v4().to_string(),
            fetch_time: Utc::now().to_rfc3339(),
            ..FetchOutcome::default()
        };

        let filters = IncidentFilters {
            priority: self.config.priority_filter.clone(),
            state: self.config.state_filter.clone(),
            updated_after: if self.config.days_back > 0 {
                Some(
                    (Utc::now() - ChronoDuration::days(self.config.days_back))
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string(),
                )
            } else {
                None
            },
        };

        let incidents = match self
            .connector
            .get_incidents(&filters, self.config.max_incidents_per_fetch)
            .await
        {
            Ok(incidents) => incidents,
            Err(e) => {
                error!("Incident fetch failed: {}", e);
                outcome.errors.push(e.to_string());
                outcome.duration_seconds = started.elapsed().as_secs_f64();
                self.record_history(&outcome).await;
                return outcome;
            }
        };
        outcome.incidents_fetched = incidents.len();

        for incident in &incidents {
            let sys_id = incident
                .get("sys_id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if sys_id.is_empty() {
                outcome.errors.push("incident without sys_id".to_string());
                continue;
            }

            let hash = self.processor.content_hash(incident);
            let cached = match self
                .metadata_store
                .get(COLLECTION_TICKETS_CACHE, &sys_id)
                .await
            {
                Ok(entry) => entry,
                Err(e) => {
                    outcome.errors.push(format!("{}: {}", sys_id, e));
                    continue;
                }
            };

            let cached_hash = cached
                .as_ref()
                .and_then(|c| c.get("content_hash"))
                .and_then(|v| v.as_str());
            if cached_hash == Some(hash.as_str()) {
                continue;
            }
            if cached.is_some() {
                outcome.updated_incidents += 1;
            } else {
                outcome.new_incidents += 1;
            }

            let processed = match self.processor.process(incident) {
                Ok(processed) => processed,
                Err(e) => {
                    outcome.errors.push(format!("{}: {}", sys_id, e));
                    continue;
                }
            };
            outcome.incidents_processed += 1;

            let mut cache_entry = json!({
                "sys_id": processed.sys_id,
                "number": processed.number,
                "data": incident,
                "content_hash": processed.content_hash,
                "fetched_at": Utc::now().to_rfc3339(),
                "updated_at": incident.get("sys_updated_on").cloned().unwrap_or(json!(null)),
                "ingested": false,
                "ingestion_result": null,
            });

            if self.config.auto_ingest {
                match self
                    .engine
                    .ingest_text(
                        &processed.number,
                        SourceType::Ticket,
                        &processed.text,
                        processed.metadata.clone(),
                    )
                    .await
                {
                    Ok(result) => {
                        if result.status == IngestStatus::Success {
                            outcome.incidents_ingested += 1;
                        }
                        cache_entry["ingested"] = json!(result.status != IngestStatus::Error);
                        cache_entry["ingestion_result"] =
                            serde_json::to_value(&result).unwrap_or(json!(null));
                    }
                    Err(e) => {
                        warn!("Ingestion of {} failed: {}", processed.number, e);
                        outcome.errors.push(format!("{}: {}", processed.number, e));
                        cache_entry["ingestion_result"] = json!(e.to_string());
                    }
                }
            }

            if let Err(e) = self
                .metadata_store
                .put(COLLECTION_TICKETS_CACHE, &sys_id, &cache_entry)
                .await
            {
                outcome.errors.push(format!("cache {}: {}", sys_id, e));
            }
        }

        outcome.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            "Fetch tick: {} fetched, {} new, {} updated, {} ingested ({:.2}s)",
            outcome.incidents_fetched,
            outcome.new_incidents,
            outcome.updated_incidents,
            outcome.incidents_ingested,
            outcome.duration_seconds
        );

        self.record_history(&outcome).await;
        outcome
    }

    async fn record_history(&self, outcome: &FetchOutcome) {
        let record = match serde_json::to_value(outcome) {
            Ok(record) => record,
            Err(e) => {
                error!("Could not serialize fetch outcome: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .metadata_store
            .put(COLLECTION_FETCH_HISTORY, &outcome.id, &record)
            .await
        {
            error!("Could not record fetch history: {}", e);
        }
    }

    /// Recent fetch history, newest first
    pub async fn fetch_history(&self, limit: usize) -> Result<Vec<FetchOutcome>> {
        let records = self
            .metadata_store
            .list(COLLECTION_FETCH_HISTORY, |_| true)
            .await?;
        let mut history: Vec<FetchOutcome> = records
            .into_iter()
            .filter_map(|r| serde_json::from_value(r).ok())
            .collect();
        history.sort_by(|a: &FetchOutcome, b: &FetchOutcome| b.fetch_time.cmp(&a.fetch_time));
        history.truncate(limit);
        Ok(history)
    }
}
