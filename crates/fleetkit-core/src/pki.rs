//! Trust hierarchy management.
//!
//! Builds the two-level certificate hierarchy backing device identity: one
//! local root CA per profile, one intermediate CA per (product, cohort)
//! pair, and end-entity certificates per device plus the one-time
//! verification certificates used during intermediate registration. Ed25519
//! signing key pairs for artifact signing live alongside, one per cohort.
//!
//! Idempotency is driven purely by file existence at the canonical paths:
//! if the certificate file is present, the existing material is reused and
//! never regenerated or validated against its key. All key material is PEM
//! on disk. Local files are always written before any remote registration
//! is attempted, so local state stays a superset of remote state.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::paths::DataPaths;

/// Errors from key generation, CSR handling, and signing. All fatal for the
/// enclosing flow.
#[derive(Debug, Error)]
pub enum PkiError {
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

    #[error("certificate operation failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("signing key operation failed: {0}")]
    SigningKey(String),

    #[error("failed to parse certificate {path}: {detail}")]
    CertificateParse { path: String, detail: String },

    /// The issuing CA's files are missing; its ensure step did not run.
    #[error("issuer material missing at {path}")]
    MissingIssuer { path: String },
}

/// Role of a node in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateRole {
    Root,
    Intermediate,
    Verification,
    EndEntity,
}

/// One certificate node: its role and the canonical paths of its material.
#[derive(Debug, Clone)]
pub struct CertificateNode {
    pub role: CertificateRole,
    pub subject_label: String,
    pub private_key_path: PathBuf,
    pub certificate_path: PathBuf,
    pub csr_path: Option<PathBuf>,
}

/// Paths of one cohort's Ed25519 artifact-signing key pair.
#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
}

/// Trust hierarchy manager bound to one configuration directory.
#[derive(Debug)]
pub struct TrustHierarchy<'a> {
    paths: &'a DataPaths,
}

impl<'a> TrustHierarchy<'a> {
    #[must_use]
    pub fn new(paths: &'a DataPaths) -> Self {
        Self { paths }
    }

    /// Ensure the self-signed root CA exists. The root is local-only and is
    /// never registered with the control plane.
    ///
    /// # Errors
    ///
    /// Returns an error if generation or the file writes fail.
    pub fn ensure_root_ca(&self, organization_name: &str) -> Result<CertificateNode, PkiError> {
        let key_path = self.paths.root_ca_key();
        let cert_path = self.paths.root_ca_cert();
        let label = format!("Root CA {organization_name}");

        if cert_path.exists() {
            debug!(cert = %cert_path.display(), "root CA already exists");
        } else {
            info!(cert = %cert_path.display(), "creating root CA");
            create_dir(&self.paths.ca_dir())?;
            generate_self_signed_root(&label, &key_path, &cert_path)?;
        }

        Ok(CertificateNode {
            role: CertificateRole::Root,
            subject_label: label,
            private_key_path: key_path,
            certificate_path: cert_path,
            csr_path: None,
        })
    }

    /// Ensure the intermediate CA for a (product, cohort) pair exists,
    /// chained directly under the root (depth 1). Remote registration is the
    /// orchestrator's job.
    ///
    /// # Errors
    ///
    /// Returns an error if the root material is missing or generation fails.
    pub fn ensure_intermediate_ca(
        &self,
        product_name: &str,
        cohort_name: &str,
    ) -> Result<CertificateNode, PkiError> {
        let dir = self.paths.intermediate_ca_dir(product_name, cohort_name);
        let key_path = dir.join("intermediate-private-key.pem");
        let csr_path = dir.join("intermediate-signing-request.pem");
        let cert_path = dir.join("intermediate-certificate.pem");
        let label = format!("Intermediate CA {product_name} {cohort_name}");

        if cert_path.exists() {
            debug!(cert = %cert_path.display(), "intermediate CA already exists");
        } else {
            let root_key = self.paths.root_ca_key();
            let root_cert = self.paths.root_ca_cert();
            if !root_cert.exists() {
                return Err(PkiError::MissingIssuer {
                    path: root_cert.display().to_string(),
                });
            }
            info!(cert = %cert_path.display(), "creating intermediate CA");
            create_dir(&dir)?;
            generate_csr(&label, &key_path, &csr_path)?;
            sign_csr(
                &csr_path,
                &root_key,
                &root_cert,
                SignConstraints::IntermediateCa,
                &cert_path,
            )?;
        }

        Ok(CertificateNode {
            role: CertificateRole::Intermediate,
            subject_label: label,
            private_key_path: key_path,
            certificate_path: cert_path,
            csr_path: Some(csr_path),
        })
    }

    /// Issue the one-time verification certificate proving possession of an
    /// intermediate's key: subject is the control-plane verification code,
    /// signed by the intermediate itself. Always regenerated; this path only
    /// runs when the intermediate is not yet registered.
    ///
    /// # Errors
    ///
    /// Returns an error if generation or signing fails.
    pub fn issue_verification_certificate(
        &self,
        verification_code: &str,
        intermediate: &CertificateNode,
    ) -> Result<CertificateNode, PkiError> {
        let dir = intermediate
            .certificate_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let key_path = dir.join("verification-private-key.pem");
        let csr_path = dir.join("verification-signing-request.pem");
        let cert_path = dir.join("verification-certificate.pem");

        info!(cert = %cert_path.display(), "signing verification certificate");
        generate_csr(verification_code, &key_path, &csr_path)?;
        sign_csr(
            &csr_path,
            &intermediate.private_key_path,
            &intermediate.certificate_path,
            SignConstraints::EndEntity,
            &cert_path,
        )?;

        Ok(CertificateNode {
            role: CertificateRole::Verification,
            subject_label: verification_code.to_string(),
            private_key_path: key_path,
            certificate_path: cert_path,
            csr_path: Some(csr_path),
        })
    }

    /// Ensure a device's end-entity certificate exists, signed by the given
    /// intermediate. Subject is the device identifier. Registration with the
    /// control plane is reconciliation, not this component's job.
    ///
    /// # Errors
    ///
    /// Returns an error if the intermediate material is missing or
    /// generation fails.
    pub fn ensure_device_certificate(
        &self,
        identifier: &str,
        intermediate: &CertificateNode,
    ) -> Result<CertificateNode, PkiError> {
        let dir = self.paths.device_dir(identifier);
        let key_path = dir.join("device-private-key.pem");
        let csr_path = dir.join("device-signing-request.pem");
        let cert_path = dir.join("device-certificate.pem");

        if cert_path.exists() {
            debug!(cert = %cert_path.display(), "device certificate already exists");
        } else {
            if !intermediate.certificate_path.exists() {
                return Err(PkiError::MissingIssuer {
                    path: intermediate.certificate_path.display().to_string(),
                });
            }
            info!(device = identifier, "creating device certificate");
            create_dir(&dir)?;
            generate_csr(identifier, &key_path, &csr_path)?;
            sign_csr(
                &csr_path,
                &intermediate.private_key_path,
                &intermediate.certificate_path,
                SignConstraints::EndEntity,
                &cert_path,
            )?;
        }

        Ok(CertificateNode {
            role: CertificateRole::EndEntity,
            subject_label: identifier.to_string(),
            private_key_path: key_path,
            certificate_path: cert_path,
            csr_path: Some(csr_path),
        })
    }

    /// Ensure the cohort's Ed25519 artifact-signing key pair exists.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or the writes fail.
    pub fn ensure_signing_key_pair(&self, cohort_name: &str) -> Result<SigningKeyPair, PkiError> {
        let dir = self.paths.signing_keys_dir();
        let private_path = dir.join(format!("{cohort_name}-private-key.pem"));
        let public_path = dir.join(format!("{cohort_name}-public-key.pem"));

        if private_path.exists() {
            debug!(key = %private_path.display(), "signing key pair already exists");
        } else {
            info!(cohort = cohort_name, "creating artifact signing key pair");
            create_dir(&dir)?;
            generate_ed25519_key_pair(&private_path, &public_path)?;
        }

        Ok(SigningKeyPair {
            private_key_path: private_path,
            public_key_path: public_path,
        })
    }
}

/// Issued-certificate constraints.
#[derive(Debug, Clone, Copy)]
enum SignConstraints {
    /// CA certificate with path length zero (may only sign end entities).
    IntermediateCa,
    /// Leaf certificate.
    EndEntity,
}

/// Generate a self-signed root key and certificate.
fn generate_self_signed_root(
    label: &str,
    key_path: &Path,
    cert_path: &Path,
) -> Result<(), PkiError> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name(label);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(SerialNumber::from(fresh_serial()));
    let cert = params.self_signed(&key)?;

    write_file(key_path, key.serialize_pem().as_bytes())?;
    write_file(cert_path, cert.pem().as_bytes())
}

/// Generate a fresh key and a CSR whose subject common name is `subject`.
fn generate_csr(subject: &str, key_path: &Path, csr_path: &Path) -> Result<(), PkiError> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name(subject);
    let csr = params.serialize_request(&key)?;

    write_file(key_path, key.serialize_pem().as_bytes())?;
    write_file(csr_path, csr.pem()?.as_bytes())
}

/// Sign a CSR with the issuer's key and certificate, applying the given
/// constraints and a fresh serial number.
fn sign_csr(
    csr_path: &Path,
    issuer_key_path: &Path,
    issuer_cert_path: &Path,
    constraints: SignConstraints,
    out_cert_path: &Path,
) -> Result<(), PkiError> {
    let (issuer, issuer_key) = load_issuer(issuer_key_path, issuer_cert_path)?;

    let csr_pem = read_file(csr_path)?;
    let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)?;
    match constraints {
        SignConstraints::IntermediateCa => {
            csr.params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
            csr.params.key_usages =
                vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        }
        SignConstraints::EndEntity => {
            csr.params.is_ca = IsCa::NoCa;
            csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        }
    }
    csr.params.serial_number = Some(SerialNumber::from(fresh_serial()));
    let cert = csr.signed_by(&issuer, &issuer_key)?;

    write_file(out_cert_path, cert.pem().as_bytes())
}

/// Reconstruct an issuer from its PEM key and certificate files.
fn load_issuer(key_path: &Path, cert_path: &Path) -> Result<(Certificate, KeyPair), PkiError> {
    let key = KeyPair::from_pem(&read_file(key_path)?)?;
    let params = CertificateParams::from_ca_cert_pem(&read_file(cert_path)?)?;
    // Rebuilding through self_signed preserves the distinguished name and
    // key identifiers, which is all signed_by consumes from the issuer.
    let cert = params.self_signed(&key)?;
    Ok((cert, key))
}

/// Read the serial number of a PEM certificate as a decimal string, the form
/// the control plane indexes CA certificates by.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a certificate.
pub fn read_serial_number(cert_path: &Path) -> Result<String, PkiError> {
    let data = fs::read(cert_path).map_err(|source| PkiError::Read {
        path: cert_path.display().to_string(),
        source,
    })?;
    let (_, pem) =
        x509_parser::pem::parse_x509_pem(&data).map_err(|e| PkiError::CertificateParse {
            path: cert_path.display().to_string(),
            detail: e.to_string(),
        })?;
    let cert = pem.parse_x509().map_err(|e| PkiError::CertificateParse {
        path: cert_path.display().to_string(),
        detail: e.to_string(),
    })?;
    Ok(cert.tbs_certificate.serial.to_str_radix(10))
}

/// Generate an Ed25519 key pair, PKCS#8 PEM on disk.
fn generate_ed25519_key_pair(private_path: &Path, public_path: &Path) -> Result<(), PkiError> {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let private_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::SigningKey(e.to_string()))?;
    let public_pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| PkiError::SigningKey(e.to_string()))?;

    write_file(private_path, private_pem.as_bytes())?;
    write_file(public_path, public_pem.as_bytes())
}

/// Raw 32-byte public key, stripped of its PEM/ASN.1 envelope. This is the
/// value registered with the control plane.
///
/// # Errors
///
/// Returns an error if the file is missing or not an Ed25519 public key.
pub fn raw_public_key_bytes(public_path: &Path) -> Result<[u8; 32], PkiError> {
    let pem = read_file(public_path)?;
    let key = VerifyingKey::from_public_key_pem(&pem)
        .map_err(|e| PkiError::SigningKey(e.to_string()))?;
    Ok(key.to_bytes())
}

fn common_name(value: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, value);
    dn
}

/// Serial derived from the wall clock; unique enough for a hierarchy that
/// issues a handful of certificates per run.
fn fresh_serial() -> u64 {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    u64::try_from(nanos).unwrap_or(1).max(1)
}

fn create_dir(path: &Path) -> Result<(), PkiError> {
    fs::create_dir_all(path).map_err(|source| PkiError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, PkiError> {
    fs::read_to_string(path).map_err(|source| PkiError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), PkiError> {
    fs::write(path, content).map_err(|source| PkiError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::DataPaths;

    fn subject_of(path: &Path) -> String {
        let data = fs::read(path).unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&data).unwrap();
        let cert = pem.parse_x509().unwrap();
        cert.tbs_certificate.subject.to_string()
    }

    fn issuer_of(path: &Path) -> String {
        let data = fs::read(path).unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&data).unwrap();
        let cert = pem.parse_x509().unwrap();
        cert.tbs_certificate.issuer.to_string()
    }

    #[test]
    fn root_ca_is_self_signed_and_created_once() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        let root = hierarchy.ensure_root_ca("acme").unwrap();
        assert_eq!(subject_of(&root.certificate_path), issuer_of(&root.certificate_path));

        let first_cert = fs::read(&root.certificate_path).unwrap();
        let first_key = fs::read(&root.private_key_path).unwrap();

        // Second call reuses the files byte for byte.
        let again = hierarchy.ensure_root_ca("acme").unwrap();
        assert_eq!(fs::read(&again.certificate_path).unwrap(), first_cert);
        assert_eq!(fs::read(&again.private_key_path).unwrap(), first_key);
    }

    #[test]
    fn intermediate_chains_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        let root = hierarchy.ensure_root_ca("acme").unwrap();
        let intermediate = hierarchy.ensure_intermediate_ca("widget", "release").unwrap();

        assert_eq!(
            issuer_of(&intermediate.certificate_path),
            subject_of(&root.certificate_path)
        );
        assert!(subject_of(&intermediate.certificate_path)
            .contains("Intermediate CA widget release"));
    }

    #[test]
    fn intermediate_without_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        assert!(matches!(
            hierarchy.ensure_intermediate_ca("widget", "release"),
            Err(PkiError::MissingIssuer { .. })
        ));
    }

    #[test]
    fn device_certificate_chains_to_intermediate() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        hierarchy.ensure_root_ca("acme").unwrap();
        let intermediate = hierarchy.ensure_intermediate_ca("widget", "release").unwrap();
        let device = hierarchy
            .ensure_device_certificate("EK-IOT-0001", &intermediate)
            .unwrap();

        assert_eq!(
            issuer_of(&device.certificate_path),
            subject_of(&intermediate.certificate_path)
        );
        assert!(subject_of(&device.certificate_path).contains("EK-IOT-0001"));

        // Reused, not regenerated.
        let first = fs::read(&device.certificate_path).unwrap();
        let again = hierarchy
            .ensure_device_certificate("EK-IOT-0001", &intermediate)
            .unwrap();
        assert_eq!(fs::read(&again.certificate_path).unwrap(), first);
    }

    #[test]
    fn serial_number_is_decimal_and_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        hierarchy.ensure_root_ca("acme").unwrap();
        let intermediate = hierarchy.ensure_intermediate_ca("widget", "release").unwrap();

        let serial = read_serial_number(&intermediate.certificate_path).unwrap();
        assert!(!serial.is_empty());
        assert!(serial.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(
            serial,
            read_serial_number(&intermediate.certificate_path).unwrap()
        );
    }

    #[test]
    fn verification_certificate_subject_is_the_code() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        hierarchy.ensure_root_ca("acme").unwrap();
        let intermediate = hierarchy.ensure_intermediate_ca("widget", "release").unwrap();
        let verification = hierarchy
            .issue_verification_certificate("VC-12345", &intermediate)
            .unwrap();

        assert!(subject_of(&verification.certificate_path).contains("VC-12345"));
        assert_eq!(
            issuer_of(&verification.certificate_path),
            subject_of(&intermediate.certificate_path)
        );
    }

    #[test]
    fn signing_key_pair_is_reused_and_exports_raw_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(tmp.path());
        let hierarchy = TrustHierarchy::new(&paths);

        let pair = hierarchy.ensure_signing_key_pair("release").unwrap();
        let raw = raw_public_key_bytes(&pair.public_key_path).unwrap();
        assert_eq!(raw.len(), 32);

        let first_private = fs::read(&pair.private_key_path).unwrap();
        let again = hierarchy.ensure_signing_key_pair("release").unwrap();
        assert_eq!(fs::read(&again.private_key_path).unwrap(), first_private);
        assert_eq!(raw, raw_public_key_bytes(&again.public_key_path).unwrap());
    }
}
