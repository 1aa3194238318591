use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use nfe_sync::blob::FsBlobStore;
use nfe_sync::cert::PkcsCredentialProvider;
use nfe_sync::client::SoapClient;
use nfe_sync::config::Config;
use nfe_sync::domain::{Company, Environment, StorageBackend};
use nfe_sync::lifecycle::LifecycleEngine;
use nfe_sync::logging;
use nfe_sync::scheduler::Scheduler;
use nfe_sync::storage::{InMemoryStorage, Storage};
use nfe_sync::sync::{SyncEngine, SyncOutcome};

#[derive(Parser)]
#[command(name = "nfe_sync")]
#[command(about = "SEFAZ NF-e acquisition and download lifecycle engine")]
#[command(version = "0.1.0")]
struct Cli {
    /// Company registry file
    #[arg(long, default_value = "companies.toml")]
    companies: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition cycle now
    Sync {
        /// Restrict to a single company by CNPJ
        #[arg(long)]
        cnpj: Option<String>,
    },
    /// Run one download sweep now
    Sweep {
        /// Restrict to a single company by CNPJ
        #[arg(long)]
        cnpj: Option<String>,
    },
    /// Run the hourly sync and five-minute sweep loops
    Schedule,
}

/// Company registry entry as written in companies.toml.
#[derive(Debug, Deserialize)]
struct CompanySeed {
    cnpj: String,
    legal_name: String,
    uf: String,
    certificate_path: String,
    certificate_password: String,
    #[serde(default)]
    staging: bool,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default = "default_true")]
    auto_manifest: bool,
    #[serde(default)]
    last_nsu: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CompanyFile {
    #[serde(default)]
    company: Vec<CompanySeed>,
}

async fn seed_companies(path: &str, storage: &InMemoryStorage) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read company registry '{}': {}", path, e))?;
    let file: CompanyFile = toml::from_str(&content)?;
    let count = file.company.len();
    for seed in file.company {
        let mut company = Company {
            id: None,
            cnpj: seed.cnpj,
            legal_name: seed.legal_name,
            uf: seed.uf,
            environment: if seed.staging { Environment::Staging } else { Environment::Production },
            certificate_path: seed.certificate_path,
            certificate_password: seed.certificate_password,
            active: seed.active,
            storage_backend: StorageBackend::Local,
            auto_manifest: seed.auto_manifest,
            last_nsu: seed.last_nsu,
            blocked_until: None,
            created_at: chrono::Utc::now(),
        };
        storage.create_company(&mut company).await?;
    }
    Ok(count)
}

async fn find_company(storage: &InMemoryStorage, cnpj: &str) -> anyhow::Result<Company> {
    storage
        .list_active_companies()
        .await?
        .into_iter()
        .find(|c| c.cnpj == cnpj)
        .ok_or_else(|| anyhow::anyhow!("no active company with CNPJ {}", cnpj))
}

fn describe(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Completed { documents } => format!("completed, {} document(s)", documents),
        SyncOutcome::Blocked { until } => format!("blocked until {}", until),
        SyncOutcome::Failed { reason } => format!("failed: {}", reason),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load()?;

    let storage = Arc::new(InMemoryStorage::new());
    let seeded = seed_companies(&cli.companies, &storage).await?;
    info!(companies = seeded, "company registry loaded");

    let provider = Arc::new(PkcsCredentialProvider);
    let client = Arc::new(SoapClient::new(config.sefaz.timeout_seconds, provider));
    let blobs = Arc::new(FsBlobStore::new(config.storage.blob_root.clone()));

    let sync_engine = Arc::new(SyncEngine::new(
        storage.clone(),
        client.clone(),
        blobs.clone(),
        config.clone(),
    ));
    let lifecycle_engine = Arc::new(LifecycleEngine::new(
        storage.clone(),
        client,
        blobs,
        config.clone(),
    ));

    match cli.command {
        Commands::Sync { cnpj } => {
            let outcomes = match cnpj {
                Some(cnpj) => {
                    let company = find_company(&storage, &cnpj).await?;
                    let outcome = sync_engine.run_company(&company).await?;
                    vec![(company, outcome)]
                }
                None => {
                    let mut results = Vec::new();
                    for (id, outcome) in sync_engine.run_all().await? {
                        if let Some(company) = storage.get_company(id).await? {
                            results.push((company, outcome));
                        }
                    }
                    results
                }
            };
            println!("\nSync results:");
            for (company, outcome) in outcomes {
                println!("   {} ({}): {}", company.legal_name, company.cnpj, describe(&outcome));
            }
        }
        Commands::Sweep { cnpj } => {
            let report = match cnpj {
                Some(cnpj) => {
                    let company = find_company(&storage, &cnpj).await?;
                    let id = company
                        .id
                        .ok_or_else(|| anyhow::anyhow!("company has no id"))?;
                    lifecycle_engine.sweep_company(id).await?
                }
                None => lifecycle_engine.sweep().await?,
            };
            match report {
                Some(report) => {
                    println!("\nSweep results:");
                    println!("   Processed: {}", report.processed);
                    println!("   Completed: {}", report.completed);
                    println!("   Cancelled: {}", report.cancelled);
                    println!("   Deferred:  {}", report.deferred);
                    println!("   Retried:   {}", report.retried);
                }
                None => println!("Sweep skipped: download lock held by another process"),
            }
        }
        Commands::Schedule => {
            info!(
                sync_minutes = config.sync.interval_minutes,
                sweep_minutes = config.lifecycle.interval_minutes,
                "starting schedule"
            );
            Scheduler::new(sync_engine, lifecycle_engine, config).run().await;
        }
    }

    Ok(())
}
