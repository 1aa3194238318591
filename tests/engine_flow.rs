//! End-to-end flow against scripted SEFAZ responses: a distribution
//! batch delivers a summary, then a sweep acknowledges the operation and
//! pulls the complete document down to disk.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;

use nfe_sync::blob::FsBlobStore;
use nfe_sync::client::SefazClient;
use nfe_sync::codec::{DistributionResponse, DocEnvelope, ManifestReceipt};
use nfe_sync::config::Config;
use nfe_sync::domain::{
    Company, DocumentKind, DownloadStatus, Environment, ManifestStatus, NfeStatus, StorageBackend,
};
use nfe_sync::error::{EngineError, Result};
use nfe_sync::lifecycle::LifecycleEngine;
use nfe_sync::storage::{InMemoryStorage, Storage};
use nfe_sync::sync::{SyncEngine, SyncOutcome};

const KEY: &str = "42251149531261000107550010000000011000000017";

fn gzip_base64(text: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    BASE64.encode(encoder.finish().unwrap())
}

struct ScriptedClient {
    distributions: Mutex<VecDeque<DistributionResponse>>,
    lookups: Mutex<VecDeque<DistributionResponse>>,
    manifests: Mutex<VecDeque<ManifestReceipt>>,
}

#[async_trait]
impl SefazClient for ScriptedClient {
    async fn fetch_distribution(
        &self,
        _company: &Company,
        _nsu: u64,
    ) -> Result<DistributionResponse> {
        self.distributions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::Storage("unscripted distribution call".to_string()))
    }

    async fn lookup_by_key(
        &self,
        _company: &Company,
        _access_key: &str,
    ) -> Result<DistributionResponse> {
        self.lookups
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::Storage("unscripted lookup call".to_string()))
    }

    async fn submit_manifest(
        &self,
        _company: &Company,
        _access_key: &str,
        _event_type: &str,
        _justification: Option<&str>,
    ) -> Result<ManifestReceipt> {
        self.manifests
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::Storage("unscripted manifest call".to_string()))
    }
}

#[tokio::test]
async fn summary_is_acquired_acknowledged_and_completed() {
    let storage = Arc::new(InMemoryStorage::new());
    let blob_dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(FsBlobStore::new(blob_dir.path()));

    let mut company = Company {
        id: None,
        cnpj: "12345678000195".to_string(),
        legal_name: "Teste LTDA".to_string(),
        uf: "SP".to_string(),
        environment: Environment::Production,
        certificate_path: "/tmp/cert.pfx".to_string(),
        certificate_password: "x".to_string(),
        active: true,
        storage_backend: StorageBackend::Local,
        auto_manifest: true,
        last_nsu: 0,
        blocked_until: None,
        created_at: Utc::now(),
    };
    storage.create_company(&mut company).await.unwrap();
    let company_id = company.id.unwrap();

    let summary = DocEnvelope {
        nsu: 7,
        schema: "resNFe_v1.01.xsd".to_string(),
        payload: gzip_base64(&format!(
            "<resNFe><chNFe>{}</chNFe><dhEmi>2025-03-07T12:00:00-03:00</dhEmi></resNFe>",
            KEY
        )),
    };
    let client = Arc::new(ScriptedClient {
        distributions: Mutex::new(VecDeque::from([DistributionResponse {
            c_stat: 138,
            message: String::new(),
            last_nsu: Some(7),
            max_nsu: Some(7),
            docs: vec![summary],
        }])),
        lookups: Mutex::new(VecDeque::from([DistributionResponse {
            c_stat: 138,
            message: String::new(),
            last_nsu: None,
            max_nsu: None,
            docs: vec![DocEnvelope {
                nsu: 0,
                schema: "procNFe_v4.00.xsd".to_string(),
                payload: gzip_base64(&format!(
                    "<nfeProc><chNFe>{}</chNFe><cStat>100</cStat></nfeProc>",
                    KEY
                )),
            }],
        }])),
        manifests: Mutex::new(VecDeque::from([ManifestReceipt {
            c_stat: 135,
            message: "Evento registrado e vinculado a NF-e".to_string(),
            protocol: Some("891250000000001".to_string()),
            registered_at: Some(Utc::now()),
        }])),
    });

    let mut config = Config::default();
    config.sync.iteration_delay_ms = 0;
    config.lifecycle.document_delay_ms = 0;

    // Acquisition: the summary lands pending with its blob on disk
    let sync = SyncEngine::new(storage.clone(), client.clone(), blobs.clone(), config.clone());
    let outcome = sync.run_company(&company).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { documents: 1 });

    let doc = storage.get_document_by_key(company_id, KEY).await.unwrap().unwrap();
    assert_eq!(doc.kind, DocumentKind::Summary);
    assert_eq!(doc.download_status, DownloadStatus::Pending);
    let summary_path = doc.blob_path.clone().unwrap();
    assert!(blobs.exists(&summary_path));

    let saved = storage.get_company(company_id).await.unwrap().unwrap();
    assert_eq!(saved.last_nsu, 7);
    assert!(saved.blocked_until.is_some());

    // Lifecycle: acknowledgment first, then the complete document
    let lifecycle = LifecycleEngine::new(storage.clone(), client, blobs.clone(), config);
    let report = lifecycle.sweep().await.unwrap().unwrap();
    assert_eq!(report.completed, 1);

    let doc = storage.get_document_by_key(company_id, KEY).await.unwrap().unwrap();
    assert_eq!(doc.kind, DocumentKind::Full);
    assert_eq!(doc.download_status, DownloadStatus::Complete);
    assert_eq!(doc.nfe_status, Some(NfeStatus::Authorized));
    assert!(doc.size_bytes > 0);

    let full_path = doc.blob_path.unwrap();
    assert!(blobs.exists(&full_path));
    assert!(!blobs.exists(&summary_path));
    assert!(full_path.starts_with("NFe/12345678000195/2025/03/"));

    let manifestation = storage
        .get_manifestation_by_key(company_id, KEY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifestation.status, ManifestStatus::Confirmed);
    assert_eq!(manifestation.event_type, "210210");
}
