//! A1 digital certificate handling. Loads a PKCS#12 bundle from disk and
//! turns it into a client identity for mutual TLS.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::domain::Company;

/// Certificate failures, classified so operators can tell a bad password
/// from a missing file without reading TLS internals.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("certificate file not found: {0}")]
    NotFound(String),

    #[error("certificate password rejected for {0}")]
    WrongPassword(String),

    #[error("certificate bundle is corrupt or not PKCS#12: {0}")]
    Corrupt(String),

    #[error("certificate bundle carries no usable key pair: {0}")]
    MissingKeyOrCert(String),
}

/// A loaded client credential, ready to attach to an HTTPS client.
#[derive(Debug)]
pub struct Credential {
    pub identity: reqwest::Identity,
    /// Owning company CNPJ, for log correlation.
    pub cnpj: String,
}

/// Boundary for obtaining TLS credentials. The engine never touches
/// certificate bytes directly.
pub trait CredentialProvider: Send + Sync {
    fn load(&self, company: &Company) -> Result<Credential, CredentialError>;
}

/// Reads PKCS#12 (.pfx) bundles from the local filesystem.
pub struct PkcsCredentialProvider;

impl CredentialProvider for PkcsCredentialProvider {
    fn load(&self, company: &Company) -> Result<Credential, CredentialError> {
        let path = Path::new(&company.certificate_path);
        if !path.exists() {
            return Err(CredentialError::NotFound(company.certificate_path.clone()));
        }
        let bytes = std::fs::read(path)
            .map_err(|e| CredentialError::Corrupt(format!("{}: {}", path.display(), e)))?;

        let identity =
            reqwest::Identity::from_pkcs12_der(&bytes, &company.certificate_password)
                .map_err(|e| classify_identity_error(&company.certificate_path, e))?;

        debug!(cnpj = %company.cnpj, path = %company.certificate_path, "certificate loaded");
        Ok(Credential { identity, cnpj: company.cnpj.clone() })
    }
}

/// Best-effort classification of the opaque TLS error. A wrong password
/// surfaces as a MAC failure in the underlying PKCS#12 parser.
fn classify_identity_error(path: &str, err: reqwest::Error) -> CredentialError {
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("mac") || text.contains("password") {
        CredentialError::WrongPassword(path.to_string())
    } else if text.contains("asn1") || text.contains("parse") || text.contains("decode") {
        CredentialError::Corrupt(format!("{}: {}", path, err))
    } else {
        CredentialError::MissingKeyOrCert(format!("{}: {}", path, err))
    }
}
