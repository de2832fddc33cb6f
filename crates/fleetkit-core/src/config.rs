//! Local configuration store.
//!
//! Three JSON documents under the fleethub config directory: the vendor CLI
//! config (profiles and the signing key pair keychain), the credentials file
//! (profile name to API key), and the tool config (selected profile and
//! organization identity). Each is read and rewritten as a whole document;
//! a missing or empty file reads as the default. Unknown fields written by
//! the vendor CLI are preserved across rewrites.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    /// A command that needs a configured profile ran before `configure`.
    #[error("no profile configured; run `fleetkit configure` first")]
    NotConfigured,
}

/// One profile entry in the vendor CLI config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileEntry {
    pub organization_name: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One keychain entry binding a named signing key pair to its remote prn
/// and local private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyPairEntry {
    pub signing_key_prn: String,
    pub signing_key_private_path: String,
}

/// Vendor CLI config document (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileEntry>,

    #[serde(default)]
    pub signing_key_pairs: BTreeMap<String, SigningKeyPairEntry>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One credentials entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub api_key: String,
}

/// Credentials document (`credentials.json`), keyed by profile name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CredentialsFile {
    pub entries: BTreeMap<String, CredentialEntry>,
}

/// Tool config document (`fleetkit.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolConfig {
    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub organization_name: Option<String>,

    #[serde(default)]
    pub organization_prn: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A fully configured profile, required by every command after `configure`.
#[derive(Debug, Clone)]
pub struct ActiveProfile {
    pub profile: String,
    pub organization_name: String,
    pub organization_prn: String,
}

impl ToolConfig {
    /// Resolve the active profile.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::NotConfigured`] if any identity field is
    /// missing.
    pub fn require_profile(&self) -> Result<ActiveProfile, ConfigStoreError> {
        match (&self.profile, &self.organization_name, &self.organization_prn) {
            (Some(profile), Some(name), Some(prn)) => Ok(ActiveProfile {
                profile: profile.clone(),
                organization_name: name.clone(),
                organization_prn: prn.clone(),
            }),
            _ => Err(ConfigStoreError::NotConfigured),
        }
    }
}

/// Read a JSON document, treating a missing or empty file as the default.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_document<T>(path: &Path) -> Result<T, ConfigStoreError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigStoreError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|source| ConfigStoreError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Rewrite a JSON document in full, creating parent directories as needed.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), ConfigStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigStoreError::Write {
            path: path.display().to_string(),
            source,
        })?;
    }
    let content =
        serde_json::to_string_pretty(document).map_err(|source| ConfigStoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    fs::write(path, content).map_err(|source| ConfigStoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    debug!(path = %path.display(), "wrote configuration document");
    Ok(())
}
