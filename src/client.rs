//! HTTPS transport to the SEFAZ web services. Envelopes come from the
//! codec; this module owns endpoints, mutual TLS and HTTP plumbing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::cert::CredentialProvider;
use crate::codec::{self, DistributionResponse, ManifestReceipt};
use crate::domain::{Company, Environment};
use crate::error::{EngineError, Result};

const DISTRIBUTION_PROD: &str =
    "https://www1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx";
const DISTRIBUTION_HOM: &str =
    "https://hom1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx";
const MANIFEST_PROD: &str =
    "https://nfe.svrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx";
const MANIFEST_HOM: &str =
    "https://nfe-homologacao.svrs.rs.gov.br/ws/recepcaoevento/recepcaoevento4.asmx";

fn distribution_endpoint(environment: Environment) -> &'static str {
    match environment {
        Environment::Production => DISTRIBUTION_PROD,
        Environment::Staging => DISTRIBUTION_HOM,
    }
}

fn manifest_endpoint(environment: Environment) -> &'static str {
    match environment {
        Environment::Production => MANIFEST_PROD,
        Environment::Staging => MANIFEST_HOM,
    }
}

/// Upstream boundary. The engines drive pagination and lifecycle against
/// this trait; tests script it, production talks SOAP.
#[async_trait]
pub trait SefazClient: Send + Sync {
    /// One distNSU round trip from the given cursor.
    async fn fetch_distribution(&self, company: &Company, nsu: u64)
        -> Result<DistributionResponse>;

    /// consChNFe lookup of a single document by access key.
    async fn lookup_by_key(
        &self,
        company: &Company,
        access_key: &str,
    ) -> Result<DistributionResponse>;

    /// Submits one recipient-manifestation event.
    async fn submit_manifest(
        &self,
        company: &Company,
        access_key: &str,
        event_type: &str,
        justification: Option<&str>,
    ) -> Result<ManifestReceipt>;
}

/// Production SOAP 1.2 client. Each company gets its own HTTP client so
/// its certificate drives its own TLS session; clients are cached so a
/// certificate is loaded once per company, not once per call.
pub struct SoapClient {
    timeout: Duration,
    provider: Arc<dyn CredentialProvider>,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl SoapClient {
    pub fn new(timeout_seconds: u64, provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_seconds),
            provider,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn http_client(&self, company: &Company) -> Result<reqwest::Client> {
        {
            let clients = self.clients.lock().unwrap();
            if let Some(client) = clients.get(&company.cnpj) {
                return Ok(client.clone());
            }
        }
        let credential = self.provider.load(company)?;
        // State servers still present chains our roots reject; the
        // client certificate is the actual authentication factor here.
        let client = reqwest::Client::builder()
            .identity(credential.identity)
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .timeout(self.timeout)
            .build()
            .map_err(|e| EngineError::Tls(e.to_string()))?;
        let mut clients = self.clients.lock().unwrap();
        clients.insert(company.cnpj.clone(), client.clone());
        Ok(client)
    }

    async fn post_soap(
        &self,
        company: &Company,
        url: &str,
        action: &str,
        envelope: String,
    ) -> Result<String> {
        let client = self.http_client(company)?;
        let content_type =
            format!("application/soap+xml; charset=utf-8; action=\"{}\"", action);

        debug!(%url, cnpj = %company.cnpj, "posting SOAP request");
        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "upstream rejected the request");
            return Err(EngineError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl SefazClient for SoapClient {
    #[instrument(skip(self, company), fields(cnpj = %company.cnpj))]
    async fn fetch_distribution(
        &self,
        company: &Company,
        nsu: u64,
    ) -> Result<DistributionResponse> {
        let envelope = codec::build_distribution_request(
            &company.cnpj,
            &company.uf,
            company.environment,
            nsu,
        )?;
        let body = self
            .post_soap(
                company,
                distribution_endpoint(company.environment),
                "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe/nfeDistDFeInteresse",
                envelope,
            )
            .await?;
        codec::parse_distribution_response(&body)
    }

    #[instrument(skip(self, company), fields(cnpj = %company.cnpj))]
    async fn lookup_by_key(
        &self,
        company: &Company,
        access_key: &str,
    ) -> Result<DistributionResponse> {
        let envelope = codec::build_key_lookup_request(
            &company.cnpj,
            &company.uf,
            company.environment,
            access_key,
        )?;
        let body = self
            .post_soap(
                company,
                distribution_endpoint(company.environment),
                "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe/nfeDistDFeInteresse",
                envelope,
            )
            .await?;
        codec::parse_distribution_response(&body)
    }

    #[instrument(skip(self, company), fields(cnpj = %company.cnpj, event_type))]
    async fn submit_manifest(
        &self,
        company: &Company,
        access_key: &str,
        event_type: &str,
        justification: Option<&str>,
    ) -> Result<ManifestReceipt> {
        let envelope = codec::build_manifest_request(
            &company.cnpj,
            access_key,
            event_type,
            company.environment,
            justification,
            Utc::now(),
        )?;
        let body = self
            .post_soap(
                company,
                manifest_endpoint(company.environment),
                "http://www.portalfiscal.inf.br/nfe/wsdl/NFeRecepcaoEvento4/nfeRecepcaoEvento",
                envelope,
            )
            .await?;
        codec::parse_manifest_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_follow_environment() {
        assert!(distribution_endpoint(Environment::Production).contains("www1"));
        assert!(distribution_endpoint(Environment::Staging).contains("hom1"));
        assert!(manifest_endpoint(Environment::Production).contains("nfe.svrs"));
        assert!(manifest_endpoint(Environment::Staging).contains("homologacao"));
    }
}
