//! Credential persistence
//!
//! A session owns exactly one credential pair. The pair is persisted through
//! a `CredentialBackend` so it survives restarts, the way the web client kept
//! it in browser local storage under `accessToken` / `refreshToken`.
//!
//! Backends are synchronous: the in-memory store in `session-client` needs
//! `set`/`clear` to be strongly ordered, and a write is a few hundred bytes.
//! Both keys are always written and removed together.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The current access/refresh credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    /// Bearer token attached to every authenticated request
    pub access: Secret<String>,
    /// Presented only to the refresh endpoint
    pub refresh: Secret<String>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
        }
    }
}

/// Persistence medium for the credential pair.
///
/// Implementations must write both credentials in one step; a reader must
/// never observe a document holding only one of them.
pub trait CredentialBackend: Send + Sync {
    /// Read the persisted pair, if any.
    fn load(&self) -> Result<Option<CredentialPair>>;

    /// Replace the persisted pair.
    fn save(&self, pair: &CredentialPair) -> Result<()>;

    /// Remove both credentials.
    fn clear(&self) -> Result<()>;
}

/// On-disk document layout. Keys match the web client's storage keys.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(rename = "accessToken", skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl StoredCredentials {
    fn into_pair(self) -> Option<CredentialPair> {
        match (self.access_token, self.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Some(CredentialPair::new(access, refresh))
            }
            _ => None,
        }
    }
}

/// Process-local backend. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend with an existing pair (e.g. restored elsewhere).
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialBackend for MemoryBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        let pair = self
            .pair
            .lock()
            .map_err(|_| Error::Io("memory backend lock poisoned".into()))?;
        Ok(pair.clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let mut slot = self
            .pair
            .lock()
            .map_err(|_| Error::Io("memory backend lock poisoned".into()))?;
        *slot = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self
            .pair
            .lock()
            .map_err(|_| Error::Io("memory backend lock poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}

/// JSON file backend.
///
/// All writes use atomic temp-file + rename so a crash mid-write never leaves
/// a half-written pair behind. The file is created 0600 on unix since it
/// holds bearer tokens.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Open the credential file at `path`.
    ///
    /// If the file doesn't exist it is created as `{}` (no session yet).
    pub fn open(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "credential file not found, starting without a session");
            write_atomic(&path, &StoredCredentials::default())?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialBackend for FileBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
        let stored: StoredCredentials = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
        let pair = stored.into_pair();
        debug!(path = %self.path.display(), present = pair.is_some(), "loaded credentials");
        Ok(pair)
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let stored = StoredCredentials {
            access_token: Some(pair.access.expose().clone()),
            refresh_token: Some(pair.refresh.expose().clone()),
        };
        write_atomic(&self.path, &stored)
    }

    fn clear(&self) -> Result<()> {
        write_atomic(&self.path, &StoredCredentials::default())
    }
}

/// Write the credential document atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target.
fn write_atomic(path: &Path, data: &StoredCredentials) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("credential path has no parent directory".into())),
    };

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
