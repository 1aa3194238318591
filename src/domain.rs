use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SEFAZ environment a company's certificate is enrolled in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
}

impl Environment {
    /// Wire indicator: tpAmb 1 = production, 2 = homologation.
    pub fn indicator(&self) -> u8 {
        match self {
            Environment::Production => 1,
            Environment::Staging => 2,
        }
    }
}

/// Where a company's document bytes are persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Remote,
}

/// A registered tax subject whose inbound documents we harvest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Option<Uuid>,
    pub cnpj: String,
    pub legal_name: String,
    /// Federative unit of authorization, e.g. "SP".
    pub uf: String,
    pub environment: Environment,
    pub certificate_path: String,
    pub certificate_password: String,
    pub active: bool,
    pub storage_backend: StorageBackend,
    /// Submit the acknowledgment manifestation automatically.
    pub auto_manifest: bool,
    /// Highest NSU already consumed from the distribution service.
    pub last_nsu: u64,
    /// While in the future, the sync controller skips this company.
    pub blocked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

/// One pagination session for one company. Created when the cursor
/// controller starts, finalized once, never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Option<Uuid>,
    pub company_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub starting_nsu: u64,
    pub ending_nsu: Option<u64>,
    pub documents_acquired: u32,
    pub error_message: Option<String>,
}

/// What kind of record a document row holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentKind {
    /// Lightweight notification (resNFe); full content still owed.
    Summary,
    /// Complete fiscal document (nfeProc).
    Full,
    /// Fiscal event (procEventoNFe / resEvento).
    Event,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    Pending,
    Processing,
    Complete,
    Error,
    Cancelled,
}

/// Legal standing of the NF-e as reported by SEFAZ.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NfeStatus {
    Authorized,
    Cancelled,
    Denied,
}

/// One fiscal document instance. Identity is the 44-digit access key;
/// a document is created once (as a summary) and upgraded in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Option<Uuid>,
    pub company_id: Uuid,
    pub sync_run_id: Option<Uuid>,
    pub access_key: String,
    pub number: String,
    /// Document model from the access key: "55" = NF-e, "65" = NFC-e.
    pub model: String,
    pub kind: DocumentKind,
    pub emitted_at: DateTime<Utc>,
    pub blob_path: Option<String>,
    pub size_bytes: u64,
    pub download_status: DownloadStatus,
    pub download_attempts: u32,
    pub last_error: Option<String>,
    pub nfe_status: Option<NfeStatus>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ManifestStatus {
    Pending,
    Sent,
    Confirmed,
    Error,
}

/// Recipient acknowledgment record for one access key.
/// At most one active manifestation per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifestation {
    pub id: Option<Uuid>,
    pub company_id: Uuid,
    pub access_key: String,
    /// NT 2020.001 event type, e.g. "210210".
    pub event_type: String,
    pub status: ManifestStatus,
    pub protocol: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// 180 days from NF-e authorization.
    pub legal_deadline: DateTime<Utc>,
    pub manifested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Which upstream operation a rate-limited call counts against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    /// distNSU pagination calls.
    Distribution,
    /// consChNFe lookup-by-access-key calls.
    KeyLookup,
    /// Recipient manifestation events.
    Manifest,
}

/// Rolling counter for one (company, kind) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub window_start: DateTime<Utc>,
    pub calls: u32,
}

/// Single global mutual-exclusion record for the lifecycle sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLock {
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Audit log severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Structured context attached to audit log entries. Typed fields
/// instead of an ad-hoc JSON blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogContext {
    pub company_id: Option<Uuid>,
    pub sync_run_id: Option<Uuid>,
    pub access_key: Option<String>,
    pub nsu: Option<u64>,
    pub c_stat: Option<u16>,
    pub iteration: Option<u32>,
    pub detail: Option<String>,
}

impl LogContext {
    pub fn company(company_id: Uuid) -> Self {
        Self { company_id: Some(company_id), ..Default::default() }
    }

    pub fn with_run(mut self, sync_run_id: Uuid) -> Self {
        self.sync_run_id = Some(sync_run_id);
        self
    }

    pub fn with_key(mut self, access_key: &str) -> Self {
        self.access_key = Some(access_key.to_string());
        self
    }

    pub fn with_nsu(mut self, nsu: u64) -> Self {
        self.nsu = Some(nsu);
        self
    }

    pub fn with_stat(mut self, c_stat: u16) -> Self {
        self.c_stat = Some(c_stat);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
