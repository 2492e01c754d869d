// Account and certificate persistence inside the working directory
//
// Layout:
//   state.json              account state
//   certs/cert.pem          current certificate chain
//   certs/key.pem           current private key
//   certs/<primary-domain>  metadata about the last issuance (write-only)

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::error::StoreError;

use super::bundle::{AccountState, CertificateBundle, LeafInfo};

const STATE_FILE: &str = "state.json";
const CERTS_DIR: &str = "certs";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Helper to get a safe display path for error messages (doesn't leak full absolute paths)
fn safe_display_path(full_path: &Path) -> String {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(relative) = full_path.strip_prefix(&cwd) {
            return relative.display().to_string();
        }
    }

    full_path.display().to_string()
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: safe_display_path(path),
        source,
    }
}

fn corrupt(path: &Path, message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: safe_display_path(path),
        message: message.into(),
    }
}

/// Issuance record written next to the certificate for operators
#[derive(Debug, Serialize)]
struct IssuanceRecord<'a> {
    domains: &'a [String],
    obtained_at: DateTime<Utc>,
    #[serde(flatten)]
    leaf: Option<LeafInfo>,
}

/// Durable storage for the account and the active certificate bundle
#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
    domains: Vec<String>,
}

impl CertificateStore {
    /// `domains` is the configured domain set, the first entry names the metadata file
    pub fn new(root: impl Into<PathBuf>, domains: Vec<String>) -> Self {
        Self {
            root: root.into(),
            domains,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.root.join(CERTS_DIR).join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join(CERTS_DIR).join(KEY_FILE)
    }

    pub fn metadata_path(&self) -> Option<PathBuf> {
        let primary = self.domains.first()?;
        Some(self.root.join(CERTS_DIR).join(primary))
    }

    /// Load the account and the bundle it last obtained
    ///
    /// `NotFound` means nothing was ever written here. An account without a
    /// complete bundle is `Corrupt`, never a reason to start over.
    pub fn load(&self) -> Result<(AccountState, CertificateBundle), StoreError> {
        match self.load_state()? {
            (account, Some(bundle)) => Ok((account, bundle)),
            (_, None) => Err(corrupt(
                &self.cert_path(),
                "Account state exists but no certificate was persisted",
            )),
        }
    }

    /// Like [`load`](Self::load), but an account whose first certificate was
    /// never persisted comes back with `None` instead of `Corrupt`
    pub fn load_state(&self) -> Result<(AccountState, Option<CertificateBundle>), StoreError> {
        let account = self.load_account()?;
        let bundle = self.load_bundle()?;

        Ok((account, bundle))
    }

    fn load_account(&self) -> Result<AccountState, StoreError> {
        let path = self.state_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(io_error(&path, e)),
        };

        let account: AccountState =
            serde_json::from_slice(&raw).map_err(|e| corrupt(&path, e.to_string()))?;

        if account.private_key.trim().is_empty() || account.registration.trim().is_empty() {
            return Err(corrupt(&path, "Account key or registration is missing"));
        }

        Ok(account)
    }

    /// Load only the certificate bundle, `None` when neither file exists
    pub fn load_bundle(&self) -> Result<Option<CertificateBundle>, StoreError> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        let cert = read_optional(&cert_path)?;
        let key = read_optional(&key_path)?;

        let (cert, key) = match (cert, key) {
            (None, None) => return Ok(None),
            (Some(_), None) => return Err(corrupt(&key_path, "Private key is missing")),
            (None, Some(_)) => return Err(corrupt(&cert_path, "Certificate is missing")),
            (Some(cert), Some(key)) => (cert, key),
        };

        if cert.is_empty() {
            return Err(corrupt(&cert_path, "Certificate file is empty"));
        }
        if key.is_empty() {
            return Err(corrupt(&key_path, "Private key file is empty"));
        }

        let obtained_at = fs::metadata(&cert_path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(CertificateBundle::new(self.domains.clone(), cert, key, obtained_at)))
    }

    pub fn save_account(&self, account: &AccountState) -> Result<(), StoreError> {
        create_private_dir(&self.root)?;

        let path = self.state_path();
        let json = serde_json::to_vec_pretty(account)
            .map_err(|e| io_error(&path, io::Error::other(e)))?;

        write_private(&path, &json)?;
        debug!("Saved account state to {}", safe_display_path(&path));

        Ok(())
    }

    /// Persist the chain and key, then the issuance record
    pub fn save_bundle(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
        let certs_dir = self.root.join(CERTS_DIR);
        create_private_dir(&self.root)?;
        create_private_dir(&certs_dir)?;

        let key_path = self.key_path();
        let cert_path = self.cert_path();

        // Both halves are written out before the two renames. A crash between
        // the renames leaves a mismatched pair, rejected on the next start.
        let key_temp = stage_private(&key_path, &bundle.private_key)?;
        let cert_temp = match stage_private(&cert_path, &bundle.certificate_chain) {
            Ok(temp) => temp,
            Err(e) => {
                let _ = fs::remove_file(&key_temp);
                return Err(e);
            }
        };

        if let Err(e) = commit(&key_temp, &key_path) {
            let _ = fs::remove_file(&cert_temp);
            return Err(e);
        }
        commit(&cert_temp, &cert_path)?;
        debug!("Saved certificate bundle to {}", safe_display_path(&certs_dir));

        if let Err(e) = self.save_metadata(bundle) {
            warn!("Failed to write issuance record: {e}");
        }

        Ok(())
    }

    fn save_metadata(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
        let Some(path) = self.metadata_path() else {
            return Ok(());
        };

        let record = IssuanceRecord {
            domains: &bundle.domains,
            obtained_at: bundle.obtained_at,
            leaf: bundle.leaf_info().ok(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| io_error(&path, io::Error::other(e)))?;

        write_private(&path, &json)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(|e| io_error(path, e))
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(path).map_err(|e| io_error(path, e))
    }
}

/// Owner-only temp file next to `path`, fsynced and ready to be renamed
fn stage_private(path: &Path, content: &[u8]) -> Result<PathBuf, StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = options.open(&temp).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });

    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(io_error(path, e));
    }

    return Ok(temp);
}

fn commit(temp: &Path, path: &Path) -> Result<(), StoreError> {
    fs::rename(temp, path).map_err(|e| {
        let _ = fs::remove_file(temp);
        io_error(path, e)
    })
}

/// Write through an owner-only temp file and rename it over the target
fn write_private(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let temp = stage_private(path, content)?;
    commit(&temp, path)
}
