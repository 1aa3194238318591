use thiserror::Error;

use crate::cert::CredentialError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("upstream returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("protocol decode error: {0}")]
    Decode(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Credential(#[from] CredentialError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("blob store error: {0}")]
    Blob(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
