//! Storage abstraction for companies, documents, runs, manifestations
//! and the coordination primitives (rate limits, download lock, audit
//! log). The in-memory backend is the test double and the default for
//! local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::constants;
use crate::domain::{
    Company, Document, DocumentKind, DownloadLock, DownloadStatus, LogContext, LogLevel,
    Manifestation, RateLimitKind, RateLimitWindow, SyncRun, SyncStatus,
};
use crate::error::{EngineError, Result};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_company(&self, company: &mut Company) -> Result<()>;
    async fn get_company(&self, id: Uuid) -> Result<Option<Company>>;
    async fn list_active_companies(&self) -> Result<Vec<Company>>;
    async fn update_company_cursor(&self, id: Uuid, last_nsu: u64) -> Result<()>;
    async fn update_company_block(&self, id: Uuid, blocked_until: Option<DateTime<Utc>>)
        -> Result<()>;

    async fn create_sync_run(&self, run: &mut SyncRun) -> Result<()>;
    async fn finalize_sync_run(
        &self,
        id: Uuid,
        status: SyncStatus,
        ending_nsu: u64,
        documents_acquired: u32,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn create_document(&self, document: &mut Document) -> Result<()>;
    /// The fiscal document record for a key (summary or full); event
    /// records are excluded.
    async fn get_document_by_key(
        &self,
        company_id: Uuid,
        access_key: &str,
    ) -> Result<Option<Document>>;
    async fn get_document_by_key_and_kind(
        &self,
        company_id: Uuid,
        access_key: &str,
        kind: DocumentKind,
    ) -> Result<Option<Document>>;
    async fn update_document(&self, document: &Document) -> Result<()>;
    /// Summaries still owed their full content, oldest first, optionally
    /// scoped to one company.
    async fn get_documents_pending(
        &self,
        company: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Document>>;
    /// Documents owed another attempt: failed ones, plus any left in
    /// `processing` by an interrupted sweep.
    async fn get_documents_for_retry(
        &self,
        company: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    async fn get_manifestation_by_key(
        &self,
        company_id: Uuid,
        access_key: &str,
    ) -> Result<Option<Manifestation>>;
    async fn upsert_manifestation(&self, manifestation: &mut Manifestation) -> Result<()>;

    /// Atomic check-and-increment against the rolling hourly budget.
    /// Returns false when the budget is spent; a false is not an error.
    async fn check_rate_limit(&self, company_id: Uuid, kind: RateLimitKind) -> Result<bool>;

    /// Attempts to take the single download lock. Returns the holder
    /// token on success, None when another live holder has it.
    async fn try_acquire_lock(&self) -> Result<Option<Uuid>>;
    /// Releases the lock if the caller still holds it. Returns false
    /// when a non-holder asked, which is a no-op.
    async fn release_lock(&self, holder: Uuid) -> Result<bool>;

    async fn append_log(&self, level: LogLevel, message: &str, context: LogContext) -> Result<()>;
}

/// One persisted audit entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub context: LogContext,
}

#[derive(Clone)]
pub struct InMemoryStorage {
    companies: Arc<Mutex<HashMap<Uuid, Company>>>,
    sync_runs: Arc<Mutex<HashMap<Uuid, SyncRun>>>,
    documents: Arc<Mutex<HashMap<Uuid, Document>>>,
    manifestations: Arc<Mutex<HashMap<Uuid, Manifestation>>>,
    rate_windows: Arc<Mutex<HashMap<(Uuid, RateLimitKind), RateLimitWindow>>>,
    download_lock: Arc<Mutex<Option<DownloadLock>>>,
    logs: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            companies: Arc::new(Mutex::new(HashMap::new())),
            sync_runs: Arc::new(Mutex::new(HashMap::new())),
            documents: Arc::new(Mutex::new(HashMap::new())),
            manifestations: Arc::new(Mutex::new(HashMap::new())),
            rate_windows: Arc::new(Mutex::new(HashMap::new())),
            download_lock: Arc::new(Mutex::new(None)),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Rate-limit core with an explicit clock so tests can drive window
    /// rollover. The whole check-and-increment happens under one lock.
    pub fn check_rate_limit_at(
        &self,
        company_id: Uuid,
        kind: RateLimitKind,
        now: DateTime<Utc>,
    ) -> bool {
        let mut windows = self.rate_windows.lock().unwrap();
        let window = windows
            .entry((company_id, kind))
            .or_insert_with(|| RateLimitWindow { window_start: now, calls: 0 });

        if now - window.window_start >= Duration::seconds(constants::RATE_WINDOW_SECS) {
            window.window_start = now;
            window.calls = 0;
        }
        if window.calls >= constants::RATE_MAX_CALLS {
            return false;
        }
        window.calls += 1;
        true
    }

    /// Lock core with an explicit clock. An expired holder is treated as
    /// dead and displaced.
    pub fn try_acquire_lock_at(&self, now: DateTime<Utc>) -> Option<Uuid> {
        let mut slot = self.download_lock.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            if existing.expires_at > now {
                return None;
            }
        }
        let holder = Uuid::new_v4();
        *slot = Some(DownloadLock {
            holder,
            acquired_at: now,
            expires_at: now + Duration::seconds(constants::LOCK_TTL_SECS),
        });
        Some(holder)
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().unwrap().clone()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_company(&self, company: &mut Company) -> Result<()> {
        let id = company.id.unwrap_or_else(Uuid::new_v4);
        company.id = Some(id);
        let mut companies = self.companies.lock().unwrap();
        companies.insert(id, company.clone());
        Ok(())
    }

    async fn get_company(&self, id: Uuid) -> Result<Option<Company>> {
        let companies = self.companies.lock().unwrap();
        Ok(companies.get(&id).cloned())
    }

    async fn list_active_companies(&self) -> Result<Vec<Company>> {
        let companies = self.companies.lock().unwrap();
        let mut active: Vec<Company> =
            companies.values().filter(|c| c.active).cloned().collect();
        active.sort_by(|a, b| a.cnpj.cmp(&b.cnpj));
        Ok(active)
    }

    async fn update_company_cursor(&self, id: Uuid, last_nsu: u64) -> Result<()> {
        let mut companies = self.companies.lock().unwrap();
        let company = companies
            .get_mut(&id)
            .ok_or_else(|| EngineError::Storage(format!("company not found: {}", id)))?;
        company.last_nsu = last_nsu;
        Ok(())
    }

    async fn update_company_block(
        &self,
        id: Uuid,
        blocked_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut companies = self.companies.lock().unwrap();
        let company = companies
            .get_mut(&id)
            .ok_or_else(|| EngineError::Storage(format!("company not found: {}", id)))?;
        company.blocked_until = blocked_until;
        Ok(())
    }

    async fn create_sync_run(&self, run: &mut SyncRun) -> Result<()> {
        let id = run.id.unwrap_or_else(Uuid::new_v4);
        run.id = Some(id);
        let mut runs = self.sync_runs.lock().unwrap();
        runs.insert(id, run.clone());
        Ok(())
    }

    async fn finalize_sync_run(
        &self,
        id: Uuid,
        status: SyncStatus,
        ending_nsu: u64,
        documents_acquired: u32,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut runs = self.sync_runs.lock().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| EngineError::Storage(format!("sync run not found: {}", id)))?;
        run.finished_at = Some(Utc::now());
        run.status = status;
        run.ending_nsu = Some(ending_nsu);
        run.documents_acquired = documents_acquired;
        run.error_message = error_message;
        Ok(())
    }

    async fn create_document(&self, document: &mut Document) -> Result<()> {
        let id = document.id.unwrap_or_else(Uuid::new_v4);
        document.id = Some(id);
        let mut documents = self.documents.lock().unwrap();
        documents.insert(id, document.clone());
        Ok(())
    }

    async fn get_document_by_key(
        &self,
        company_id: Uuid,
        access_key: &str,
    ) -> Result<Option<Document>> {
        let documents = self.documents.lock().unwrap();
        Ok(documents
            .values()
            .find(|d| {
                d.company_id == company_id
                    && d.access_key == access_key
                    && d.kind != DocumentKind::Event
            })
            .cloned())
    }

    async fn get_document_by_key_and_kind(
        &self,
        company_id: Uuid,
        access_key: &str,
        kind: DocumentKind,
    ) -> Result<Option<Document>> {
        let documents = self.documents.lock().unwrap();
        Ok(documents
            .values()
            .find(|d| {
                d.company_id == company_id && d.access_key == access_key && d.kind == kind
            })
            .cloned())
    }

    async fn update_document(&self, document: &Document) -> Result<()> {
        let id = document
            .id
            .ok_or_else(|| EngineError::Storage("document has no id".to_string()))?;
        let mut documents = self.documents.lock().unwrap();
        if !documents.contains_key(&id) {
            return Err(EngineError::Storage(format!("document not found: {}", id)));
        }
        documents.insert(id, document.clone());
        Ok(())
    }

    async fn get_documents_pending(
        &self,
        company: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let documents = self.documents.lock().unwrap();
        let mut pending: Vec<Document> = documents
            .values()
            .filter(|d| {
                d.download_status == DownloadStatus::Pending
                    && company.map_or(true, |c| d.company_id == c)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|d| d.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_documents_for_retry(
        &self,
        company: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let documents = self.documents.lock().unwrap();
        let mut stalled: Vec<Document> = documents
            .values()
            .filter(|d| {
                matches!(
                    d.download_status,
                    DownloadStatus::Error | DownloadStatus::Processing
                ) && company.map_or(true, |c| d.company_id == c)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|d| d.created_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn get_manifestation_by_key(
        &self,
        company_id: Uuid,
        access_key: &str,
    ) -> Result<Option<Manifestation>> {
        let manifestations = self.manifestations.lock().unwrap();
        Ok(manifestations
            .values()
            .find(|m| m.company_id == company_id && m.access_key == access_key)
            .cloned())
    }

    async fn upsert_manifestation(&self, manifestation: &mut Manifestation) -> Result<()> {
        let mut manifestations = self.manifestations.lock().unwrap();
        // At most one manifestation per (company, access key)
        let existing_id = manifestations
            .values()
            .find(|m| {
                m.company_id == manifestation.company_id
                    && m.access_key == manifestation.access_key
            })
            .and_then(|m| m.id);
        let id = manifestation.id.or(existing_id).unwrap_or_else(Uuid::new_v4);
        manifestation.id = Some(id);
        manifestations.insert(id, manifestation.clone());
        Ok(())
    }

    async fn check_rate_limit(&self, company_id: Uuid, kind: RateLimitKind) -> Result<bool> {
        Ok(self.check_rate_limit_at(company_id, kind, Utc::now()))
    }

    async fn try_acquire_lock(&self) -> Result<Option<Uuid>> {
        Ok(self.try_acquire_lock_at(Utc::now()))
    }

    async fn release_lock(&self, holder: Uuid) -> Result<bool> {
        let mut slot = self.download_lock.lock().unwrap();
        match slot.as_ref() {
            // Only the owner releases; a displaced holder is a no-op.
            Some(existing) if existing.holder == holder => {
                *slot = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_log(&self, level: LogLevel, message: &str, context: LogContext) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        logs.push(LogEntry { at: Utc::now(), level, message: message.to_string(), context });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_allows_twenty_then_rejects() {
        let storage = InMemoryStorage::new();
        let company = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..constants::RATE_MAX_CALLS {
            assert!(storage.check_rate_limit_at(company, RateLimitKind::KeyLookup, now));
        }
        assert!(!storage.check_rate_limit_at(company, RateLimitKind::KeyLookup, now));
        // Other kinds and companies have independent budgets
        assert!(storage.check_rate_limit_at(company, RateLimitKind::Distribution, now));
        assert!(storage.check_rate_limit_at(Uuid::new_v4(), RateLimitKind::KeyLookup, now));
    }

    #[test]
    fn rate_limit_window_rolls_over() {
        let storage = InMemoryStorage::new();
        let company = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..constants::RATE_MAX_CALLS {
            storage.check_rate_limit_at(company, RateLimitKind::Manifest, now);
        }
        assert!(!storage.check_rate_limit_at(company, RateLimitKind::Manifest, now));

        let later = now + Duration::seconds(constants::RATE_WINDOW_SECS);
        assert!(storage.check_rate_limit_at(company, RateLimitKind::Manifest, later));
    }

    #[test]
    fn lock_is_mutually_exclusive_until_released() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();

        let holder = storage.try_acquire_lock_at(now).unwrap();
        assert!(storage.try_acquire_lock_at(now).is_none());

        assert!(futures_block(storage.release_lock(holder)).unwrap());
        assert!(storage.try_acquire_lock_at(now).is_some());
    }

    #[test]
    fn expired_lock_is_acquirable() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();

        let stale = storage.try_acquire_lock_at(now);
        assert!(stale.is_some());

        let later = now + Duration::seconds(constants::LOCK_TTL_SECS + 1);
        assert!(storage.try_acquire_lock_at(later).is_some());
    }

    #[test]
    fn release_by_non_owner_keeps_the_lock() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();

        storage.try_acquire_lock_at(now).unwrap();
        assert!(!futures_block(storage.release_lock(Uuid::new_v4())).unwrap());
        assert!(storage.try_acquire_lock_at(now).is_none());
    }

    #[test]
    fn audit_log_keeps_typed_context() {
        let storage = InMemoryStorage::new();
        let company = Uuid::new_v4();
        futures_block(storage.append_log(
            LogLevel::Info,
            "sync started",
            LogContext::company(company).with_nsu(5),
        ))
        .unwrap();

        let logs = storage.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "sync started");
        assert_eq!(logs[0].context.company_id, Some(company));
        assert_eq!(logs[0].context.nsu, Some(5));
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
