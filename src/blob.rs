//! Document byte storage. XML payloads live outside the metadata store,
//! under a deterministic directory layout keyed by model, company and
//! emission month.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use crate::domain::DocumentKind;
use crate::error::{EngineError, Result};

/// Relative location of one document's bytes:
/// `<NFe|NFCe>/<cnpj>/<year>/<month>[/Resumos|/Eventos]/<access_key>[-evento].xml`
pub fn document_path(
    cnpj: &str,
    model: &str,
    kind: DocumentKind,
    emitted_at: DateTime<Utc>,
    access_key: &str,
) -> String {
    let family = if model == "65" { "NFCe" } else { "NFe" };
    let (subdir, suffix) = match kind {
        DocumentKind::Full => ("", ""),
        DocumentKind::Summary => ("Resumos/", ""),
        DocumentKind::Event => ("Eventos/", "-evento"),
    };
    format!(
        "{}/{}/{}/{:02}/{}{}{}.xml",
        family,
        cnpj,
        emitted_at.year(),
        emitted_at.month(),
        subdir,
        access_key,
        suffix
    )
}

/// Byte-storage boundary. Paths are relative; the backend decides where
/// they land.
pub trait BlobStore: Send + Sync {
    fn save(&self, path: &str, bytes: &[u8]) -> Result<()>;
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    fn delete(&self, path: &str) -> Result<()>;
}

/// Stores blobs under a root directory on the local filesystem.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl BlobStore for FsBlobStore {
    fn save(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::Blob(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        fs::write(&full, bytes)
            .map_err(|e| EngineError::Blob(format!("write {}: {}", full.display(), e)))?;
        debug!(path = %full.display(), size = bytes.len(), "blob saved");
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| EngineError::Blob(format!("read {}: {}", full.display(), e)))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Blob(format!("delete {}: {}", full.display(), e))),
        }
    }
}

impl FsBlobStore {
    /// True when the path resolves to an existing file.
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }
}
