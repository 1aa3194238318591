//! Download lifecycle: upgrades waiting summaries into complete
//! documents. A sweep runs under the global download lock, resets
//! previously failed documents, then works through the pending batch
//! company by company.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::blob::{document_path, BlobStore};
use crate::client::SefazClient;
use crate::codec::{self, DocSchema};
use crate::config::Config;
use crate::constants;
use crate::domain::{
    Company, Document, DocumentKind, DownloadStatus, LogContext, LogLevel, ManifestStatus,
    Manifestation, NfeStatus, RateLimitKind,
};
use crate::error::Result;
use crate::storage::Storage;

/// What happened to one document during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOutcome {
    /// Full content acquired and stored.
    Completed,
    /// SEFAZ reports the document cancelled; terminal, no bytes owed.
    Cancelled,
    /// Budget exhausted; the document was left untouched.
    Deferred,
    /// Attempt failed; the document will be retried on a later sweep.
    Retry,
}

/// Whether the manifestation prerequisite lets the lookup proceed.
enum ManifestGate {
    Ready,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: u32,
    pub completed: u32,
    pub cancelled: u32,
    pub deferred: u32,
    pub retried: u32,
}

impl SweepReport {
    fn record(&mut self, outcome: DocOutcome) {
        self.processed += 1;
        match outcome {
            DocOutcome::Completed => self.completed += 1,
            DocOutcome::Cancelled => self.cancelled += 1,
            DocOutcome::Deferred => self.deferred += 1,
            DocOutcome::Retry => self.retried += 1,
        }
    }
}

pub struct LifecycleEngine {
    storage: Arc<dyn Storage>,
    client: Arc<dyn SefazClient>,
    blobs: Arc<dyn BlobStore>,
    config: Config,
}

impl LifecycleEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn SefazClient>,
        blobs: Arc<dyn BlobStore>,
        config: Config,
    ) -> Self {
        Self { storage, client, blobs, config }
    }

    /// One full sweep. Returns None when another holder has the lock.
    pub async fn sweep(&self) -> Result<Option<SweepReport>> {
        self.sweep_filtered(None).await
    }

    /// Manual entry point: sweeps only the given company's documents.
    pub async fn sweep_company(&self, company_id: Uuid) -> Result<Option<SweepReport>> {
        self.sweep_filtered(Some(company_id)).await
    }

    async fn sweep_filtered(&self, only_company: Option<Uuid>) -> Result<Option<SweepReport>> {
        let holder = match self.storage.try_acquire_lock().await? {
            Some(holder) => holder,
            None => {
                info!("download lock held elsewhere, skipping sweep");
                return Ok(None);
            }
        };

        // The lock is released on every path, including failure. A
        // failed release must not mask the sweep's own result; the TTL
        // reclaims the slot either way.
        let result = self.sweep_locked(only_company).await;
        if let Err(e) = self.storage.release_lock(holder).await {
            warn!(error = %e, "failed to release the download lock");
        }
        result.map(Some)
    }

    #[instrument(skip(self))]
    async fn sweep_locked(&self, only_company: Option<Uuid>) -> Result<SweepReport> {
        let batch_size = self.config.lifecycle.batch_size;

        // Documents that failed earlier, or were left mid-attempt by an
        // interrupted sweep, get a fresh start.
        for mut stalled in self
            .storage
            .get_documents_for_retry(only_company, batch_size)
            .await?
        {
            stalled.download_status = DownloadStatus::Pending;
            stalled.download_attempts = 0;
            self.storage.update_document(&stalled).await?;
        }

        let pending = self
            .storage
            .get_documents_pending(only_company, batch_size)
            .await?;
        if pending.is_empty() {
            return Ok(SweepReport::default());
        }
        info!(count = pending.len(), "processing pending documents");

        let mut by_company: HashMap<Uuid, Vec<Document>> = HashMap::new();
        for document in pending {
            by_company.entry(document.company_id).or_default().push(document);
        }

        let mut report = SweepReport::default();
        for (company_id, documents) in by_company {
            let company = match self.storage.get_company(company_id).await? {
                Some(company) if company.active => company,
                _ => {
                    warn!(%company_id, "company missing or inactive, skipping its documents");
                    continue;
                }
            };
            let mut first = true;
            for document in documents {
                if !first && self.config.lifecycle.document_delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.lifecycle.document_delay_ms,
                    ))
                    .await;
                }
                first = false;
                let outcome = self.process_document(&company, document).await?;
                report.record(outcome);
            }
        }
        counter!("sefaz_sweep_documents").increment(report.processed as u64);
        Ok(report)
    }

    /// Drives one summary through manifestation and lookup.
    async fn process_document(&self, company: &Company, document: Document) -> Result<DocOutcome> {
        let company_id = document.company_id;

        if company.auto_manifest {
            match self.ensure_manifested(company, &document).await? {
                ManifestGate::Ready => {}
                ManifestGate::Deferred => return Ok(DocOutcome::Deferred),
                // Without a registered acknowledgment SEFAZ refuses the
                // lookup, so the document is not attempted this sweep.
                ManifestGate::Failed => return Ok(DocOutcome::Retry),
            }
        }

        // Budget check comes before the attempt counter; an exhausted
        // budget leaves the document untouched.
        if !self
            .storage
            .check_rate_limit(company_id, RateLimitKind::KeyLookup)
            .await?
        {
            return Ok(DocOutcome::Deferred);
        }

        let mut document = document;
        document.download_status = DownloadStatus::Processing;
        document.download_attempts += 1;
        self.storage.update_document(&document).await?;

        match self.client.lookup_by_key(company, &document.access_key).await {
            Ok(response) => self.apply_lookup(company, document, response).await,
            Err(e) => {
                self.fail_document(document, e.to_string()).await?;
                Ok(DocOutcome::Retry)
            }
        }
    }

    /// Makes sure an acknowledgment ("Ciência da Operação") is registered
    /// for the document's key. Anything short of `Ready` holds the
    /// lookup back this sweep.
    async fn ensure_manifested(
        &self,
        company: &Company,
        document: &Document,
    ) -> Result<ManifestGate> {
        let company_id = document.company_id;
        let existing = self
            .storage
            .get_manifestation_by_key(company_id, &document.access_key)
            .await?;
        match existing.as_ref().map(|m| m.status) {
            Some(ManifestStatus::Confirmed) | Some(ManifestStatus::Sent) => {
                return Ok(ManifestGate::Ready)
            }
            // A submission already in flight does not hold the download back.
            Some(ManifestStatus::Pending) => {
                info!(access_key = %document.access_key, "manifestation pending, proceeding");
                return Ok(ManifestGate::Ready);
            }
            // Absent or errored: (re)submit before the lookup.
            None | Some(ManifestStatus::Error) => {}
        }
        if !self
            .storage
            .check_rate_limit(company_id, RateLimitKind::Manifest)
            .await?
        {
            return Ok(ManifestGate::Deferred);
        }

        let mut manifestation = existing.unwrap_or_else(|| Manifestation {
            id: None,
            company_id,
            access_key: document.access_key.clone(),
            event_type: constants::EVENT_ACKNOWLEDGMENT.to_string(),
            status: ManifestStatus::Pending,
            protocol: None,
            attempts: 0,
            last_error: None,
            legal_deadline: document.emitted_at
                + ChronoDuration::days(constants::MANIFEST_DEADLINE_DAYS),
            manifested_at: None,
            created_at: Utc::now(),
        });
        manifestation.attempts += 1;

        let submitted = self
            .client
            .submit_manifest(
                company,
                &document.access_key,
                constants::EVENT_ACKNOWLEDGMENT,
                None,
            )
            .await;

        match submitted {
            // 573 means the event was already registered by an earlier
            // attempt whose response we lost; that also counts.
            Ok(receipt)
                if receipt.c_stat == constants::CSTAT_EVENT_REGISTERED
                    || receipt.c_stat == 573 =>
            {
                manifestation.status = ManifestStatus::Confirmed;
                manifestation.protocol = receipt.protocol;
                manifestation.manifested_at = receipt.registered_at.or_else(|| Some(Utc::now()));
                manifestation.last_error = None;
                self.storage.upsert_manifestation(&mut manifestation).await?;
                counter!("sefaz_manifestations_confirmed").increment(1);
                Ok(ManifestGate::Ready)
            }
            Ok(receipt) => {
                let error = format!("cStat {}: {}", receipt.c_stat, receipt.message);
                manifestation.status = ManifestStatus::Error;
                manifestation.last_error = Some(error.clone());
                self.storage.upsert_manifestation(&mut manifestation).await?;
                self.storage
                    .append_log(
                        LogLevel::Warning,
                        "manifestation rejected",
                        LogContext::company(company_id)
                            .with_key(&document.access_key)
                            .with_stat(receipt.c_stat)
                            .with_detail(error),
                    )
                    .await?;
                Ok(ManifestGate::Failed)
            }
            Err(e) => {
                manifestation.status = ManifestStatus::Error;
                manifestation.last_error = Some(e.to_string());
                self.storage.upsert_manifestation(&mut manifestation).await?;
                Ok(ManifestGate::Failed)
            }
        }
    }

    /// Applies a lookup response to the document record.
    async fn apply_lookup(
        &self,
        company: &Company,
        mut document: Document,
        response: codec::DistributionResponse,
    ) -> Result<DocOutcome> {
        // Cancellation is terminal; there are no bytes to fetch.
        if matches!(codec::legal_status_from_code(response.c_stat), Some(NfeStatus::Cancelled)) {
            document.download_status = DownloadStatus::Cancelled;
            document.nfe_status = Some(NfeStatus::Cancelled);
            document.last_error = None;
            self.storage.update_document(&document).await?;
            counter!("sefaz_documents_cancelled").increment(1);
            return Ok(DocOutcome::Cancelled);
        }

        let full_payload = response
            .docs
            .iter()
            .find(|d| codec::classify_schema(&d.schema) == DocSchema::Full);
        let envelope = match full_payload {
            Some(envelope) => envelope,
            None => {
                let reason = format!(
                    "cStat {}: {} (no full document in response)",
                    response.c_stat, response.message
                );
                self.fail_document(document, reason).await?;
                return Ok(DocOutcome::Retry);
            }
        };

        let xml = match codec::decompress_payload(&envelope.payload) {
            Ok(xml) => xml,
            Err(e) => {
                self.fail_document(document, e.to_string()).await?;
                return Ok(DocOutcome::Retry);
            }
        };

        let path = document_path(
            &company.cnpj,
            &document.model,
            DocumentKind::Full,
            document.emitted_at,
            &document.access_key,
        );
        // A storage failure here is an attempt failure like any other;
        // the document must stay retryable.
        if let Err(e) = self.blobs.save(&path, xml.as_bytes()) {
            self.fail_document(document, e.to_string()).await?;
            return Ok(DocOutcome::Retry);
        }

        // The summary blob is superseded; losing the delete is harmless.
        if let Some(old) = document.blob_path.take() {
            if old != path {
                let _ = self.blobs.delete(&old);
            }
        }

        let status = codec::first_text(&xml, "cStat")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .and_then(codec::legal_status_from_code)
            .unwrap_or(NfeStatus::Authorized);

        document.kind = DocumentKind::Full;
        document.download_status = DownloadStatus::Complete;
        document.nfe_status = Some(status);
        document.blob_path = Some(path);
        document.size_bytes = xml.len() as u64;
        document.last_error = None;
        self.storage.update_document(&document).await?;
        counter!("sefaz_documents_completed").increment(1);

        self.storage
            .append_log(
                LogLevel::Info,
                "full document acquired",
                LogContext::company(document.company_id).with_key(&document.access_key),
            )
            .await?;
        Ok(DocOutcome::Completed)
    }

    async fn fail_document(&self, mut document: Document, reason: String) -> Result<()> {
        warn!(access_key = %document.access_key, %reason, "document attempt failed");
        document.download_status = DownloadStatus::Error;
        document.last_error = Some(reason);
        self.storage.update_document(&document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DistributionResponse, DocEnvelope, ManifestReceipt};
    use crate::domain::Environment;
    use crate::error::EngineError;
    use crate::storage::InMemoryStorage;
    use crate::sync::tests::{
        gzip_base64, seeded_company, test_config, MemBlobStore, MockClient, KEY_A,
    };

    fn registered_receipt() -> ManifestReceipt {
        ManifestReceipt {
            c_stat: 135,
            message: "Evento registrado".to_string(),
            protocol: Some("891250000000001".to_string()),
            registered_at: Some(Utc::now()),
        }
    }

    fn full_lookup_response(key: &str) -> DistributionResponse {
        DistributionResponse {
            c_stat: 138,
            message: String::new(),
            last_nsu: None,
            max_nsu: None,
            docs: vec![DocEnvelope {
                nsu: 0,
                schema: "procNFe_v4.00.xsd".to_string(),
                payload: gzip_base64(&format!(
                    "<nfeProc><chNFe>{}</chNFe><cStat>100</cStat></nfeProc>",
                    key
                )),
            }],
        }
    }

    async fn seed_pending_summary(storage: &InMemoryStorage, company: &Company) -> Document {
        let mut document = Document {
            id: None,
            company_id: company.id.unwrap(),
            sync_run_id: None,
            access_key: KEY_A.to_string(),
            number: "000000001".to_string(),
            model: "55".to_string(),
            kind: DocumentKind::Summary,
            emitted_at: Utc::now(),
            blob_path: Some("NFe/x/Resumos/a.xml".to_string()),
            size_bytes: 10,
            download_status: DownloadStatus::Pending,
            download_attempts: 0,
            last_error: None,
            nfe_status: None,
            created_at: Utc::now(),
        };
        storage.create_document(&mut document).await.unwrap();
        document
    }

    fn engine(
        storage: &InMemoryStorage,
        client: Arc<MockClient>,
        blobs: Arc<dyn crate::blob::BlobStore>,
    ) -> LifecycleEngine {
        LifecycleEngine::new(Arc::new(storage.clone()), client, blobs, test_config())
    }

    /// Blob store that fails the next N saves, then behaves.
    struct FlakyBlobs {
        inner: MemBlobStore,
        failures: std::sync::Mutex<u32>,
    }

    impl crate::blob::BlobStore for FlakyBlobs {
        fn save(&self, path: &str, bytes: &[u8]) -> crate::error::Result<()> {
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(EngineError::Blob("disk full".to_string()));
            }
            self.inner.save(path, bytes)
        }
        fn read(&self, path: &str) -> crate::error::Result<Vec<u8>> {
            self.inner.read(path)
        }
        fn delete(&self, path: &str) -> crate::error::Result<()> {
            self.inner.delete(path)
        }
    }

    /// Storage whose lock release always fails, as a dropped backend
    /// connection would.
    struct BrokenReleaseStorage {
        inner: InMemoryStorage,
    }

    #[async_trait::async_trait]
    impl Storage for BrokenReleaseStorage {
        async fn create_company(&self, company: &mut Company) -> Result<()> {
            self.inner.create_company(company).await
        }
        async fn get_company(&self, id: Uuid) -> Result<Option<Company>> {
            self.inner.get_company(id).await
        }
        async fn list_active_companies(&self) -> Result<Vec<Company>> {
            self.inner.list_active_companies().await
        }
        async fn update_company_cursor(&self, id: Uuid, last_nsu: u64) -> Result<()> {
            self.inner.update_company_cursor(id, last_nsu).await
        }
        async fn update_company_block(
            &self,
            id: Uuid,
            blocked_until: Option<chrono::DateTime<Utc>>,
        ) -> Result<()> {
            self.inner.update_company_block(id, blocked_until).await
        }
        async fn create_sync_run(&self, run: &mut crate::domain::SyncRun) -> Result<()> {
            self.inner.create_sync_run(run).await
        }
        async fn finalize_sync_run(
            &self,
            id: Uuid,
            status: crate::domain::SyncStatus,
            ending_nsu: u64,
            documents_acquired: u32,
            error_message: Option<String>,
        ) -> Result<()> {
            self.inner
                .finalize_sync_run(id, status, ending_nsu, documents_acquired, error_message)
                .await
        }
        async fn create_document(&self, document: &mut Document) -> Result<()> {
            self.inner.create_document(document).await
        }
        async fn get_document_by_key(
            &self,
            company_id: Uuid,
            access_key: &str,
        ) -> Result<Option<Document>> {
            self.inner.get_document_by_key(company_id, access_key).await
        }
        async fn get_document_by_key_and_kind(
            &self,
            company_id: Uuid,
            access_key: &str,
            kind: DocumentKind,
        ) -> Result<Option<Document>> {
            self.inner
                .get_document_by_key_and_kind(company_id, access_key, kind)
                .await
        }
        async fn update_document(&self, document: &Document) -> Result<()> {
            self.inner.update_document(document).await
        }
        async fn get_documents_pending(
            &self,
            company: Option<Uuid>,
            limit: usize,
        ) -> Result<Vec<Document>> {
            self.inner.get_documents_pending(company, limit).await
        }
        async fn get_documents_for_retry(
            &self,
            company: Option<Uuid>,
            limit: usize,
        ) -> Result<Vec<Document>> {
            self.inner.get_documents_for_retry(company, limit).await
        }
        async fn get_manifestation_by_key(
            &self,
            company_id: Uuid,
            access_key: &str,
        ) -> Result<Option<Manifestation>> {
            self.inner.get_manifestation_by_key(company_id, access_key).await
        }
        async fn upsert_manifestation(&self, manifestation: &mut Manifestation) -> Result<()> {
            self.inner.upsert_manifestation(manifestation).await
        }
        async fn check_rate_limit(&self, company_id: Uuid, kind: RateLimitKind) -> Result<bool> {
            self.inner.check_rate_limit(company_id, kind).await
        }
        async fn try_acquire_lock(&self) -> Result<Option<Uuid>> {
            self.inner.try_acquire_lock().await
        }
        async fn release_lock(&self, _holder: Uuid) -> Result<bool> {
            Err(EngineError::Storage("connection lost".to_string()))
        }
        async fn append_log(
            &self,
            level: LogLevel,
            message: &str,
            context: LogContext,
        ) -> Result<()> {
            self.inner.append_log(level, message, context).await
        }
    }

    #[tokio::test]
    async fn acknowledges_then_downloads_full_document() {
        let storage = InMemoryStorage::new();
        let company = seeded_company(&storage).await;
        seed_pending_summary(&storage, &company).await;

        let client = Arc::new(MockClient::new());
        client.manifests.lock().unwrap().push_back(Ok(registered_receipt()));
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));
        let blobs = Arc::new(MemBlobStore::new());
        blobs.save("NFe/x/Resumos/a.xml", b"<resNFe/>").unwrap();

        let report = engine(&storage, client, blobs.clone()).sweep().await.unwrap().unwrap();
        assert_eq!(report.completed, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Complete);
        assert_eq!(doc.kind, DocumentKind::Full);
        assert_eq!(doc.nfe_status, Some(NfeStatus::Authorized));
        assert_eq!(doc.download_attempts, 1);
        assert!(doc.size_bytes > 0);
        // Summary blob was replaced by the full document
        assert!(!blobs.blobs.lock().unwrap().contains_key("NFe/x/Resumos/a.xml"));
        assert!(blobs.blobs.lock().unwrap().keys().any(|k| k.ends_with(&format!("{}.xml", KEY_A))));

        let manifestation = storage
            .get_manifestation_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifestation.status, ManifestStatus::Confirmed);
        assert_eq!(manifestation.protocol.as_deref(), Some("891250000000001"));
    }

    #[tokio::test]
    async fn failed_manifestation_defers_the_lookup() {
        let storage = InMemoryStorage::new();
        let company = seeded_company(&storage).await;
        seed_pending_summary(&storage, &company).await;

        let client = Arc::new(MockClient::new());
        client
            .manifests
            .lock()
            .unwrap()
            .push_back(Err(EngineError::Tls("handshake failed".to_string())));
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));

        let report = engine(&storage, client.clone(), Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.retried, 1);

        // Lookup was never attempted and the document was not touched
        assert_eq!(client.lookups.lock().unwrap().len(), 1);
        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Pending);
        assert_eq!(doc.download_attempts, 0);
    }

    #[tokio::test]
    async fn sent_manifestation_is_not_resubmitted() {
        let storage = InMemoryStorage::new();
        let company = seeded_company(&storage).await;
        let document = seed_pending_summary(&storage, &company).await;

        let mut manifestation = Manifestation {
            id: None,
            company_id: company.id.unwrap(),
            access_key: KEY_A.to_string(),
            event_type: crate::constants::EVENT_ACKNOWLEDGMENT.to_string(),
            status: ManifestStatus::Sent,
            protocol: None,
            attempts: 1,
            last_error: None,
            legal_deadline: document.emitted_at + ChronoDuration::days(180),
            manifested_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        storage.upsert_manifestation(&mut manifestation).await.unwrap();

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));

        // No manifest response is scripted: a submission attempt would
        // fail and defer the document, so completion proves it was skipped.
        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn cancelled_document_is_terminal_without_bytes() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        seed_pending_summary(&storage, &company).await;

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(DistributionResponse {
            c_stat: 101,
            message: "Cancelamento homologado".to_string(),
            last_nsu: None,
            max_nsu: None,
            docs: vec![],
        }));

        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.cancelled, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Cancelled);
        assert_eq!(doc.nfe_status, Some(NfeStatus::Cancelled));
        assert_eq!(doc.kind, DocumentKind::Summary);
    }

    #[tokio::test]
    async fn exhausted_lookup_budget_leaves_document_untouched() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        seed_pending_summary(&storage, &company).await;

        let now = Utc::now();
        for _ in 0..crate::constants::RATE_MAX_CALLS {
            storage.check_rate_limit_at(company.id.unwrap(), RateLimitKind::KeyLookup, now);
        }

        let client = Arc::new(MockClient::new());
        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.deferred, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Pending);
        assert_eq!(doc.download_attempts, 0);
    }

    #[tokio::test]
    async fn errored_documents_restart_from_zero_attempts() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        let mut document = seed_pending_summary(&storage, &company).await;
        document.download_status = DownloadStatus::Error;
        document.download_attempts = 7;
        document.last_error = Some("timeout".to_string());
        storage.update_document(&document).await.unwrap();

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));

        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.completed, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        // Reset to zero on pickup, then one fresh attempt
        assert_eq!(doc.download_attempts, 1);
        assert_eq!(doc.download_status, DownloadStatus::Complete);
    }

    #[tokio::test]
    async fn lookup_failure_marks_error_and_keeps_retrying() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        seed_pending_summary(&storage, &company).await;

        let client = Arc::new(MockClient::new());
        client
            .lookups
            .lock()
            .unwrap()
            .push_back(Err(EngineError::Tls("reset by peer".to_string())));

        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.retried, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Error);
        assert!(doc.last_error.is_some());
    }

    #[tokio::test]
    async fn blob_write_failure_keeps_document_retryable() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        seed_pending_summary(&storage, &company).await;

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));
        let blobs = Arc::new(FlakyBlobs {
            inner: MemBlobStore::new(),
            failures: std::sync::Mutex::new(1),
        });

        let engine = engine(&storage, client, blobs);
        let report = engine.sweep().await.unwrap().unwrap();
        assert_eq!(report.retried, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Error);
        assert!(doc.last_error.as_deref().unwrap_or("").contains("disk full"));

        // The next sweep picks the document back up and completes it.
        let report = engine.sweep().await.unwrap().unwrap();
        assert_eq!(report.completed, 1);
        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Complete);
    }

    #[tokio::test]
    async fn interrupted_processing_document_is_picked_back_up() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        let mut document = seed_pending_summary(&storage, &company).await;
        document.download_status = DownloadStatus::Processing;
        document.download_attempts = 3;
        storage.update_document(&document).await.unwrap();

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));

        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.completed, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Complete);
        // Reset on pickup, then one fresh attempt
        assert_eq!(doc.download_attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_manifest_budget_defers_the_document() {
        let storage = InMemoryStorage::new();
        let company = seeded_company(&storage).await;
        seed_pending_summary(&storage, &company).await;

        let now = Utc::now();
        for _ in 0..crate::constants::RATE_MAX_CALLS {
            storage.check_rate_limit_at(company.id.unwrap(), RateLimitKind::Manifest, now);
        }

        let client = Arc::new(MockClient::new());
        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.deferred, 1);

        let doc = storage
            .get_document_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Pending);
        assert_eq!(doc.download_attempts, 0);
        // No submission was even drafted
        assert!(storage
            .get_manifestation_by_key(company.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sweep_report_survives_a_failed_lock_release() {
        let storage = InMemoryStorage::new();
        let mut company = seeded_company(&storage).await;
        company.auto_manifest = false;
        storage.create_company(&mut company).await.unwrap();
        seed_pending_summary(&storage, &company).await;

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));

        let engine = LifecycleEngine::new(
            Arc::new(BrokenReleaseStorage { inner: storage.clone() }),
            client,
            Arc::new(MemBlobStore::new()),
            test_config(),
        );
        let report = engine.sweep().await.unwrap().unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn sweep_skips_when_lock_is_held() {
        let storage = InMemoryStorage::new();
        let _holder = storage.try_acquire_lock_at(Utc::now()).unwrap();

        let client = Arc::new(MockClient::new());
        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep()
            .await
            .unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn manual_sweep_targets_one_company() {
        let storage = InMemoryStorage::new();
        let mut company_a = seeded_company(&storage).await;
        company_a.auto_manifest = false;
        storage.create_company(&mut company_a).await.unwrap();
        seed_pending_summary(&storage, &company_a).await;

        let mut company_b = Company {
            cnpj: "98765432000100".to_string(),
            environment: Environment::Production,
            ..company_a.clone()
        };
        company_b.id = None;
        storage.create_company(&mut company_b).await.unwrap();

        let client = Arc::new(MockClient::new());
        let report = engine(&storage, client, Arc::new(MemBlobStore::new()))
            .sweep_company(company_b.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        // Company B has no pending documents; A's were filtered out
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn company_sweep_reset_is_not_crowded_out_by_other_backlogs() {
        let storage = InMemoryStorage::new();
        let mut company_a = seeded_company(&storage).await;
        company_a.auto_manifest = false;
        storage.create_company(&mut company_a).await.unwrap();
        let mut doc_a = seed_pending_summary(&storage, &company_a).await;
        doc_a.download_status = DownloadStatus::Error;
        doc_a.created_at = Utc::now() - ChronoDuration::minutes(10);
        storage.update_document(&doc_a).await.unwrap();

        let mut company_b = Company {
            cnpj: "98765432000100".to_string(),
            ..company_a.clone()
        };
        company_b.id = None;
        storage.create_company(&mut company_b).await.unwrap();
        let mut doc_b = Document {
            id: None,
            company_id: company_b.id.unwrap(),
            created_at: Utc::now(),
            ..doc_a.clone()
        };
        storage.create_document(&mut doc_b).await.unwrap();

        let client = Arc::new(MockClient::new());
        client.lookups.lock().unwrap().push_back(Ok(full_lookup_response(KEY_A)));

        // A batch of one: company A's older row would win a global fetch.
        let mut config = test_config();
        config.lifecycle.batch_size = 1;
        let engine = LifecycleEngine::new(
            Arc::new(storage.clone()),
            client,
            Arc::new(MemBlobStore::new()),
            config,
        );
        let report = engine.sweep_company(company_b.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(report.completed, 1);

        let doc = storage
            .get_document_by_key(company_b.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Complete);
        // Company A's backlog was left alone
        let doc = storage
            .get_document_by_key(company_a.id.unwrap(), KEY_A)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.download_status, DownloadStatus::Error);
    }
}
