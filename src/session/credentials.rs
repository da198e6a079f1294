//! Credential material persistence
//!
//! The blob is opaque: whatever the protocol session hands over in a
//! credential update is written back verbatim and replayed on the next
//! connect. A missing file means "start fresh".

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::CredentialError;

/// File name inside the session directory
pub const CREDS_FILE: &str = "creds.json";

/// Opaque credential material owned by the protocol session
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBlob(pub Vec<u8>);

impl std::fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialBlob({} bytes)", self.0.len())
    }
}

/// Credential store rooted at the session directory
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }

    /// Load stored credentials; `None` when nothing has been saved yet
    pub async fn load(&self) -> Result<Option<CredentialBlob>, CredentialError> {
        let path = self.path();
        match fs::read(&path).await {
            Ok(bytes) => {
                debug!("Loaded credentials from {:?} ({} bytes)", path, bytes.len());
                Ok(Some(CredentialBlob(bytes)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No credentials at {:?}, starting fresh", path);
                Ok(None)
            }
            Err(source) => Err(CredentialError::Read { path, source }),
        }
    }

    /// Persist a credential update, replacing the previous blob atomically
    pub async fn save(&self, blob: &CredentialBlob) -> Result<(), CredentialError> {
        let path = self.path();

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CredentialError::Write {
                path: self.dir.clone(),
                source,
            })?;

        let tmp = self.dir.join(format!("{}.tmp", CREDS_FILE));
        fs::write(&tmp, &blob.0)
            .await
            .map_err(|source| CredentialError::Write {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| CredentialError::Write {
                path: path.clone(),
                source,
            })?;

        debug!("Saved credentials to {:?} ({} bytes)", path, blob.0.len());
        Ok(())
    }

    /// Whether a previous session left credentials behind
    pub async fn exists(&self) -> bool {
        fs::try_exists(self.path()).await.unwrap_or(false)
    }
}
