//! Canonical on-disk layout.
//!
//! All local state lives under the fleethub CLI configuration directory so
//! the vendor CLI and this tool see the same profiles and keychain. The
//! directory resolves from `FLEETHUB_CONFIG_DIRECTORY` when set, otherwise
//! from the platform config home.

use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "FLEETHUB_CONFIG_DIRECTORY";

/// Subdirectory holding all fleetkit-generated state.
const DATA_DIR: &str = "fleetkit-data";

/// Resolved filesystem layout for one configuration directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Resolve the layout from the environment, falling back to the platform
    /// default (`~/.config/fleethub` on Linux).
    #[must_use]
    pub fn resolve() -> Self {
        let root = std::env::var_os(CONFIG_DIR_ENV).map_or_else(
            || {
                let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
                home.join(".config").join("fleethub")
            },
            PathBuf::from,
        );
        Self { root }
    }

    /// Use an explicit configuration directory (tests, non-standard layouts).
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Configuration directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Vendor CLI config document (profiles, signing key pair keychain).
    #[must_use]
    pub fn cli_config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Vendor CLI credentials document (profile name to API key).
    #[must_use]
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.json")
    }

    /// Tool-specific config document (selected profile, organization).
    #[must_use]
    pub fn tool_config_file(&self) -> PathBuf {
        self.root.join("fleetkit.json")
    }

    /// Root CA directory.
    #[must_use]
    pub fn ca_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR).join("ca")
    }

    /// Root CA private key.
    #[must_use]
    pub fn root_ca_key(&self) -> PathBuf {
        self.ca_dir().join("root-private-key.pem")
    }

    /// Root CA certificate.
    #[must_use]
    pub fn root_ca_cert(&self) -> PathBuf {
        self.ca_dir().join("root-certificate.pem")
    }

    /// Directory owning one (product, cohort) intermediate CA.
    #[must_use]
    pub fn intermediate_ca_dir(&self, product: &str, cohort: &str) -> PathBuf {
        self.ca_dir().join(product).join(cohort)
    }

    /// Per-device state directory.
    #[must_use]
    pub fn device_dir(&self, identifier: &str) -> PathBuf {
        self.root.join(DATA_DIR).join("devices").join(identifier)
    }

    /// Signing key pair directory.
    #[must_use]
    pub fn signing_keys_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR).join("signing-keys")
    }

    /// Generated artifact payload directory.
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR).join("artifacts")
    }

    /// Payload file for one (artifact, version, target) binary.
    #[must_use]
    pub fn artifact_payload(&self, name: &str, version: &str, target: &str) -> PathBuf {
        self.artifacts_dir().join(format!("{name}-{version}-{target}"))
    }
}
