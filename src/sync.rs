//! Cursor-driven acquisition from the distribution service. One sync run
//! pages a single company forward from its last consumed NSU until the
//! feed is exhausted, throttled, or the iteration ceiling is hit.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::blob::{document_path, BlobStore};
use crate::client::SefazClient;
use crate::codec::{self, DistributionResponse, DocEnvelope, DocSchema};
use crate::config::Config;
use crate::constants;
use crate::domain::{
    Company, Document, DocumentKind, DownloadStatus, LogContext, LogLevel, NfeStatus,
    RateLimitKind, SyncRun, SyncStatus,
};
use crate::error::{EngineError, Result};
use crate::storage::Storage;

/// How one company's sync run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Pagination ran to a stopping point; documents is the count of
    /// records created or upgraded during the run.
    Completed { documents: u32 },
    /// Company was inside a block window; nothing was attempted.
    Blocked { until: DateTime<Utc> },
    Failed { reason: String },
}

pub struct SyncEngine {
    storage: Arc<dyn Storage>,
    client: Arc<dyn SefazClient>,
    blobs: Arc<dyn BlobStore>,
    config: Config,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn SefazClient>,
        blobs: Arc<dyn BlobStore>,
        config: Config,
    ) -> Self {
        Self { storage, client, blobs, config }
    }

    /// Syncs every active company in turn. One company's failure never
    /// prevents the next from running.
    pub async fn run_all(&self) -> Result<Vec<(Uuid, SyncOutcome)>> {
        let companies = self.storage.list_active_companies().await?;
        info!(count = companies.len(), "starting sync cycle");

        let mut outcomes = Vec::with_capacity(companies.len());
        for company in &companies {
            let id = match company.id {
                Some(id) => id,
                None => continue,
            };
            let outcome = match self.run_company(company).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(cnpj = %company.cnpj, error = %e, "sync run errored");
                    SyncOutcome::Failed { reason: e.to_string() }
                }
            };
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    /// Runs the pagination loop for a single company.
    #[instrument(skip(self, company), fields(cnpj = %company.cnpj))]
    pub async fn run_company(&self, company: &Company) -> Result<SyncOutcome> {
        let now = Utc::now();
        if let Some(until) = company.blocked_until {
            if until > now {
                info!(until = %until, "company is blocked, skipping");
                return Ok(SyncOutcome::Blocked { until });
            }
        }
        let company_id = company
            .id
            .ok_or_else(|| EngineError::Storage("company has no id".to_string()))?;

        let mut run = SyncRun {
            id: None,
            company_id,
            started_at: now,
            finished_at: None,
            status: SyncStatus::Running,
            starting_nsu: company.last_nsu,
            ending_nsu: None,
            documents_acquired: 0,
            error_message: None,
        };
        self.storage.create_sync_run(&mut run).await?;
        let run_id = run.id.ok_or_else(|| EngineError::Storage("run has no id".to_string()))?;
        counter!("sefaz_sync_runs").increment(1);

        let mut cursor = company.last_nsu;
        let mut acquired: u32 = 0;
        let mut budget_stopped = false;

        for iteration in 1..=self.config.sync.max_iterations {
            if !self
                .storage
                .check_rate_limit(company_id, RateLimitKind::Distribution)
                .await?
            {
                // Budget exhausted; stop cleanly and keep what we have.
                self.storage
                    .append_log(
                        LogLevel::Warning,
                        "distribution rate budget exhausted, stopping run",
                        LogContext::company(company_id).with_run(run_id).with_nsu(cursor),
                    )
                    .await?;
                budget_stopped = true;
                break;
            }

            let response = match self.client.fetch_distribution(company, cursor).await {
                Ok(response) => response,
                Err(e) => match self.simulated_response(company, cursor, &e) {
                    Some(simulated) => simulated,
                    None => {
                        self.finalize(run_id, SyncStatus::Failed, cursor, acquired, Some(e.to_string()))
                            .await?;
                        return Ok(SyncOutcome::Failed { reason: e.to_string() });
                    }
                },
            };

            match response.c_stat {
                constants::CSTAT_DOCUMENTS_FOUND => {
                    for envelope in &response.docs {
                        match self.persist_document(company, run_id, envelope).await {
                            Ok(true) => acquired += 1,
                            Ok(false) => {}
                            Err(e) => {
                                // One bad payload must not abort the run.
                                warn!(nsu = envelope.nsu, error = %e, "skipping payload");
                                self.storage
                                    .append_log(
                                        LogLevel::Error,
                                        "failed to persist payload",
                                        LogContext::company(company_id)
                                            .with_run(run_id)
                                            .with_nsu(envelope.nsu)
                                            .with_detail(e.to_string()),
                                    )
                                    .await?;
                            }
                        }
                    }
                    if let Some(last) = response.last_nsu {
                        cursor = last;
                        self.storage.update_company_cursor(company_id, cursor).await?;
                    }
                    let exhausted = matches!(
                        (response.last_nsu, response.max_nsu),
                        (Some(last), Some(max)) if last >= max
                    );
                    if exhausted {
                        // Feed fully consumed; back off before polling again.
                        self.block_company(company_id, run_id, response.c_stat).await?;
                        self.finalize(run_id, SyncStatus::Completed, cursor, acquired, None)
                            .await?;
                        return Ok(SyncOutcome::Completed { documents: acquired });
                    }
                }
                constants::CSTAT_NO_DOCUMENTS => {
                    if let Some(last) = response.last_nsu {
                        cursor = last;
                        self.storage.update_company_cursor(company_id, cursor).await?;
                    }
                    self.block_company(company_id, run_id, response.c_stat).await?;
                    self.finalize(run_id, SyncStatus::Completed, cursor, acquired, None).await?;
                    return Ok(SyncOutcome::Completed { documents: acquired });
                }
                constants::CSTAT_THROTTLED => {
                    counter!("sefaz_sync_throttled").increment(1);
                    // SEFAZ tells us where our cursor should have been.
                    if let Some(last) = response.last_nsu {
                        if last > cursor {
                            cursor = last;
                            self.storage.update_company_cursor(company_id, cursor).await?;
                        }
                    }
                    self.block_company(company_id, run_id, response.c_stat).await?;
                    let reason = format!("cStat 656: {}", response.message);
                    self.finalize(run_id, SyncStatus::Failed, cursor, acquired, Some(reason.clone()))
                        .await?;
                    return Ok(SyncOutcome::Failed { reason });
                }
                other => {
                    let reason = format!("cStat {}: {}", other, response.message);
                    self.storage
                        .append_log(
                            LogLevel::Error,
                            "distribution rejected",
                            LogContext::company(company_id)
                                .with_run(run_id)
                                .with_stat(other)
                                .with_iteration(iteration),
                        )
                        .await?;
                    self.finalize(run_id, SyncStatus::Failed, cursor, acquired, Some(reason.clone()))
                        .await?;
                    return Ok(SyncOutcome::Failed { reason });
                }
            }

            if self.config.sync.iteration_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.sync.iteration_delay_ms,
                ))
                .await;
            }
        }

        if budget_stopped {
            // Deferral, not failure; progress is already saved.
            self.finalize(run_id, SyncStatus::Completed, cursor, acquired, None).await?;
            return Ok(SyncOutcome::Completed { documents: acquired });
        }

        // The endpoint never reported exhaustion within the ceiling.
        let reason = format!(
            "iteration ceiling ({}) reached without exhaustion",
            self.config.sync.max_iterations
        );
        self.finalize(run_id, SyncStatus::Failed, cursor, acquired, Some(reason.clone()))
            .await?;
        Ok(SyncOutcome::Failed { reason })
    }

    /// Outside production, a transport failure can be replaced by an
    /// empty batch so the rest of the pipeline stays exercisable.
    fn simulated_response(
        &self,
        company: &Company,
        cursor: u64,
        error: &EngineError,
    ) -> Option<DistributionResponse> {
        use crate::domain::Environment;
        if !self.config.sefaz.allow_simulation || company.environment == Environment::Production {
            return None;
        }
        warn!(cnpj = %company.cnpj, error = %error, "substituting simulated empty batch");
        Some(DistributionResponse {
            c_stat: constants::CSTAT_NO_DOCUMENTS,
            message: "simulated".to_string(),
            last_nsu: Some(cursor),
            max_nsu: Some(cursor),
            docs: Vec::new(),
        })
    }

    async fn block_company(&self, company_id: Uuid, run_id: Uuid, c_stat: u16) -> Result<()> {
        let until = Utc::now() + ChronoDuration::minutes(constants::BLOCK_MINUTES);
        self.storage.update_company_block(company_id, Some(until)).await?;
        self.storage
            .append_log(
                LogLevel::Info,
                "company blocked until next poll window",
                LogContext::company(company_id).with_run(run_id).with_stat(c_stat),
            )
            .await
    }

    async fn finalize(
        &self,
        run_id: Uuid,
        status: SyncStatus,
        ending_nsu: u64,
        acquired: u32,
        error_message: Option<String>,
    ) -> Result<()> {
        self.storage
            .finalize_sync_run(run_id, status, ending_nsu, acquired, error_message)
            .await
    }

    /// Persists one decompressed payload. Returns true when a record was
    /// created or upgraded. Identity is the access key; replays are no-ops.
    async fn persist_document(
        &self,
        company: &Company,
        run_id: Uuid,
        envelope: &DocEnvelope,
    ) -> Result<bool> {
        let company_id = company
            .id
            .ok_or_else(|| EngineError::Storage("company has no id".to_string()))?;
        let xml = codec::decompress_payload(&envelope.payload)?;
        let schema = codec::classify_schema(&envelope.schema);
        if schema == DocSchema::Unknown {
            warn!(schema = %envelope.schema, nsu = envelope.nsu, "unknown schema, skipping");
            return Ok(false);
        }
        let access_key = codec::first_text(&xml, "chNFe")
            .ok_or_else(|| EngineError::Decode("payload carries no access key".to_string()))?;
        codec::validate_access_key(&access_key)?;

        let (kind, status, nfe_status) = match schema {
            DocSchema::Full => {
                (DocumentKind::Full, DownloadStatus::Complete, Some(NfeStatus::Authorized))
            }
            DocSchema::Summary => (DocumentKind::Summary, DownloadStatus::Pending, None),
            DocSchema::Event | DocSchema::EventSummary => {
                (DocumentKind::Event, DownloadStatus::Complete, None)
            }
            DocSchema::Unknown => unreachable!(),
        };

        // Events share the access key with the document they refer to,
        // so their replay check is by key and kind.
        let existing = if kind == DocumentKind::Event {
            self.storage
                .get_document_by_key_and_kind(company_id, &access_key, DocumentKind::Event)
                .await?
        } else {
            self.storage.get_document_by_key(company_id, &access_key).await?
        };

        if let Some(mut existing) = existing {
            // A full document upgrades a waiting summary in place.
            if existing.kind == DocumentKind::Summary && kind == DocumentKind::Full {
                let path = document_path(
                    &company.cnpj,
                    &existing.model,
                    DocumentKind::Full,
                    existing.emitted_at,
                    &access_key,
                );
                self.blobs.save(&path, xml.as_bytes())?;
                if let Some(old) = existing.blob_path.take() {
                    if old != path {
                        let _ = self.blobs.delete(&old);
                    }
                }
                existing.kind = DocumentKind::Full;
                existing.download_status = DownloadStatus::Complete;
                existing.nfe_status = Some(NfeStatus::Authorized);
                existing.blob_path = Some(path);
                existing.size_bytes = xml.len() as u64;
                self.storage.update_document(&existing).await?;
                counter!("sefaz_documents_upgraded").increment(1);
                return Ok(true);
            }
            return Ok(false);
        }

        let emitted_at = codec::first_text(&xml, "dhEmi")
            .or_else(|| codec::first_text(&xml, "dhEvento"))
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let path = document_path(&company.cnpj, codec::model_from_key(&access_key), kind, emitted_at, &access_key);
        self.blobs.save(&path, xml.as_bytes())?;

        let mut document = Document {
            id: None,
            company_id,
            sync_run_id: Some(run_id),
            access_key: access_key.clone(),
            number: codec::number_from_key(&access_key).to_string(),
            model: codec::model_from_key(&access_key).to_string(),
            kind,
            emitted_at,
            blob_path: Some(path),
            size_bytes: xml.len() as u64,
            download_status: status,
            download_attempts: 0,
            last_error: None,
            nfe_status,
            created_at: Utc::now(),
        };
        self.storage.create_document(&mut document).await?;
        counter!("sefaz_documents_acquired").increment(1);
        Ok(true)
    }
}
