//! Fleet provisioning flows.
//!
//! The orchestrator sequences the trust hierarchy, the resource reconciler,
//! and the environment codec into the four end-to-end flows: configure,
//! create-product, register-devices, and publish-release. Every flow is a
//! bounded batch job: a failure aborts the remaining steps, and re-running
//! the command is the recovery mechanism — each step is idempotent.
//!
//! Local file writes always happen before the corresponding remote
//! registration, so local state never lags the control plane.

use std::fs;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{
    CliConfig, ConfigStoreError, CredentialEntry, CredentialsFile, ProfileEntry,
    SigningKeyPairEntry, ToolConfig, read_document, write_document,
};
use crate::envblock::{BootEnvironment, EnvBlockError};
use crate::manifest::{BundleSpec, CohortSpec, Manifest};
use crate::paths::DataPaths;
use crate::pki::{self, CertificateNode, PkiError, TrustHierarchy};
use crate::reconcile::{
    ControlPlane, ControlPlaneError, ReconcileError, ResourceRequest, RolloutPhase, ensure,
};

/// Size of the boot-environment block written for each device, matching the
/// region size declared in `fw_env.config`.
pub const BOOT_ENV_BLOCK_SIZE: usize = 0x800;

/// Boot-environment key naming the active release prn.
pub const ENV_KEY_RELEASE_PRN: &str = "fleet_release_prn";

/// Boot-environment key naming the active release version.
pub const ENV_KEY_RELEASE_VERSION: &str = "fleet_release_version";

/// Seed prn written before the device's first update check-in replaces it.
const SEED_RELEASE_PRN: &str = "0";

/// Environment-driver config pointing the firmware at the block on disk.
const FW_ENV_CONFIG: &str = "/etc/fleetd/uboot.env 0x0000 0x0800\n";

/// Remote-access-tunnel pre-up hook: reference-counts sessions per
/// destination port and starts the service on the first connection.
const RAT_PRE_UP: &str = r#"#!/usr/bin/env bash
#
# Args
# 1: Wireguard network interface name
# 2: Destination service port number

set -e

IFNAME=$1
DPORT=$2

COUNTER_FILE="/tmp/fleetd_counter_${DPORT}"

if [[ ! -f "$COUNTER_FILE" ]]; then
  echo 0 > "$COUNTER_FILE"
fi

COUNTER=$(cat "$COUNTER_FILE")

# First connection for this port starts the service.
if [ "$COUNTER" -le 0 ]; then
  case $DPORT in
    22)
      exec /usr/sbin/sshd
      ;;
    *)
      ;;
  esac
fi

COUNTER=$((COUNTER + 1))
echo "$COUNTER" > "$COUNTER_FILE"
"#;

/// Remote-access-tunnel pre-down hook: decrements the session counter and
/// stops the service when the last connection closes.
const RAT_PRE_DOWN: &str = r#"#!/usr/bin/env bash
#
# Args
# 1: Wireguard network interface name
# 2: Destination service port number

set -e

IFNAME=$1
DPORT=$2

COUNTER_FILE="/tmp/fleetd_counter_${DPORT}"

if [[ ! -f "$COUNTER_FILE" ]]; then
  COUNTER=1
fi

COUNTER=$(cat "$COUNTER_FILE")
COUNTER=$((COUNTER - 1))
echo "$COUNTER" > "$COUNTER_FILE"

# Last connection for this port stops the service.
if [ "$COUNTER" -le 0 ]; then
  case $DPORT in
    22)
      killall sshd
      ;;
    *)
      ;;
  esac
fi
"#;

/// Errors surfaced by the provisioning flows.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigStoreError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    EnvBlock(#[from] EnvBlockError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("control plane rejected {operation}: {detail}")]
    Rejected { operation: String, detail: String },

    #[error("malformed control-plane response for {operation}: {detail}")]
    MalformedResponse { operation: String, detail: String },

    #[error("cohort `{0}` is not defined in the manifest")]
    UnknownCohort(String),

    #[error("bundle `{0}` is not defined in the manifest")]
    UnknownBundle(String),
}

/// Configure flow: write the profile, credentials, and tool config, ensure
/// the root CA, and verify the control plane is reachable.
///
/// Re-running with the same name overwrites the profile in place.
///
/// # Errors
///
/// Fails if any document write, root CA generation, or the reachability
/// probe fails.
pub fn configure(
    client: &dyn ControlPlane,
    paths: &DataPaths,
    organization_name: &str,
    organization_prn: &str,
    api_key: &str,
) -> Result<(), ProvisionError> {
    info!(organization = organization_name, "configuring profile");

    let mut cli_config: CliConfig = read_document(&paths.cli_config_file())?;
    cli_config.profiles.insert(
        organization_name.to_string(),
        ProfileEntry {
            organization_name: organization_name.to_string(),
            extra: Default::default(),
        },
    );
    write_document(&paths.cli_config_file(), &cli_config)?;

    let mut credentials: CredentialsFile = read_document(&paths.credentials_file())?;
    credentials.entries.insert(
        organization_name.to_string(),
        CredentialEntry {
            api_key: api_key.to_string(),
        },
    );
    write_document(&paths.credentials_file(), &credentials)?;

    let mut tool_config: ToolConfig = read_document(&paths.tool_config_file())?;
    tool_config.profile = Some(organization_name.to_string());
    tool_config.organization_name = Some(organization_name.to_string());
    tool_config.organization_prn = Some(organization_prn.to_string());
    write_document(&paths.tool_config_file(), &tool_config)?;

    TrustHierarchy::new(paths).ensure_root_ca(organization_name)?;

    // Reachability probe; a bad key or missing profile fails the flow here
    // rather than midway through provisioning.
    let response = client.invoke(&cli_args(["users", "me"]))?;
    if !response.success {
        return Err(ProvisionError::Rejected {
            operation: "users me".to_string(),
            detail: response.stderr.trim().to_string(),
        });
    }
    info!("profile configured and control plane reachable");
    Ok(())
}

/// Create-product flow: ensure the product, then for every cohort archetype
/// its cohort, intermediate CA (registered with a JITP binding), and
/// artifact-signing key pair (registered remotely and recorded in the
/// keychain config).
///
/// # Errors
///
/// Fails on the first non-idempotent control-plane rejection or local
/// crypto/write failure.
pub fn create_product(
    client: &dyn ControlPlane,
    paths: &DataPaths,
    manifest: &Manifest,
    product_name: &str,
) -> Result<(), ProvisionError> {
    let tool_config: ToolConfig = read_document(&paths.tool_config_file())?;
    let active = tool_config.require_profile()?;
    let hierarchy = TrustHierarchy::new(paths);

    info!(product = product_name, "ensuring product");
    let product = ensure(
        client,
        &ResourceRequest::product(&active.organization_prn, product_name),
    )?;

    for cohort_spec in &manifest.cohorts {
        let cohort = ensure(
            client,
            &ResourceRequest::cohort(
                &active.organization_prn,
                &product.prn,
                &cohort_spec.name,
                &cohort_spec.description,
            ),
        )?;

        let intermediate = hierarchy.ensure_intermediate_ca(product_name, &cohort_spec.name)?;
        register_intermediate_ca(
            client,
            &hierarchy,
            &intermediate,
            product_name,
            &cohort_spec.name,
            &cohort.prn,
        )?;

        ensure_cohort_signing_key(client, paths, &hierarchy, &active.organization_prn, cohort_spec)?;
    }
    Ok(())
}

/// Register an intermediate CA with the control plane, keyed by certificate
/// serial. Already-registered serials are an idempotent no-op; otherwise a
/// one-time verification code is signed into a verification certificate and
/// both are registered together with the JITP policy binding.
fn register_intermediate_ca(
    client: &dyn ControlPlane,
    hierarchy: &TrustHierarchy<'_>,
    intermediate: &CertificateNode,
    product_name: &str,
    cohort_name: &str,
    cohort_prn: &str,
) -> Result<(), ProvisionError> {
    let serial = pki::read_serial_number(&intermediate.certificate_path)?;
    let response = client.invoke(&cli_args([
        "ca-certificates",
        "get",
        "--ca-certificate-serial",
        &serial,
    ]))?;
    if response.success {
        debug!(serial = %serial, "intermediate CA already registered");
        return Ok(());
    }

    info!(serial = %serial, "registering intermediate CA");
    let response = client.invoke(&cli_args(["ca-certificates", "create-verification-code"]))?;
    if !response.success {
        return Err(ProvisionError::Rejected {
            operation: "ca-certificates create-verification-code".to_string(),
            detail: response.stderr.trim().to_string(),
        });
    }
    let body: Value = serde_json::from_str(&response.stdout).map_err(|e| {
        ProvisionError::MalformedResponse {
            operation: "ca-certificates create-verification-code".to_string(),
            detail: e.to_string(),
        }
    })?;
    let code = body
        .pointer("/data/verification_code")
        .and_then(Value::as_str)
        .ok_or_else(|| ProvisionError::MalformedResponse {
            operation: "ca-certificates create-verification-code".to_string(),
            detail: "missing /data/verification_code".to_string(),
        })?;

    let verification = hierarchy.issue_verification_certificate(code, intermediate)?;

    let response = client.invoke(&cli_args([
        "ca-certificates",
        "create",
        "--certificate-path",
        &intermediate.certificate_path.display().to_string(),
        "--verification-certificate-path",
        &verification.certificate_path.display().to_string(),
        "--description",
        &format!("Intermediate CA: {product_name}:{cohort_name}"),
        "--jitp-cohort-prn",
        cohort_prn,
        "--jitp-product-name",
        product_name,
        "--jitp-tags",
        "JITP",
        "--jitp-description",
        "JITP",
    ]))?;
    if !response.success {
        return Err(ProvisionError::Rejected {
            operation: "ca-certificates create".to_string(),
            detail: response.stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// Ensure a cohort's signing key pair locally, register it remotely keyed by
/// its raw public key, and record the pair in the keychain config.
fn ensure_cohort_signing_key(
    client: &dyn ControlPlane,
    paths: &DataPaths,
    hierarchy: &TrustHierarchy<'_>,
    organization_prn: &str,
    cohort: &CohortSpec,
) -> Result<(), ProvisionError> {
    let pair = hierarchy.ensure_signing_key_pair(&cohort.name)?;
    let raw = pki::raw_public_key_bytes(&pair.public_key_path)?;
    let value = BASE64.encode(raw);
    let key_name = format!("{}-signing-key", cohort.name);

    let handle = ensure(
        client,
        &ResourceRequest::signing_key(organization_prn, &key_name, &value),
    )?;

    let entry = SigningKeyPairEntry {
        signing_key_prn: handle.prn,
        signing_key_private_path: pair.private_key_path.display().to_string(),
    };
    let mut cli_config: CliConfig = read_document(&paths.cli_config_file())?;
    let unchanged = cli_config.signing_key_pairs.get(&key_name).is_some_and(|existing| {
        existing.signing_key_prn == entry.signing_key_prn
            && existing.signing_key_private_path == entry.signing_key_private_path
    });
    if !unchanged {
        cli_config.signing_key_pairs.insert(key_name, entry);
        write_document(&paths.cli_config_file(), &cli_config)?;
    }
    Ok(())
}

/// Register-devices flow: for every device in the manifest, materialize its
/// local environment (boot block, driver config, node config, tunnel
/// hooks), issue its certificate under the cohort's intermediate, and
/// register the device and its certificate remotely.
///
/// # Errors
///
/// Fails on the first local write, crypto, or control-plane failure.
pub fn register_devices(
    client: &dyn ControlPlane,
    paths: &DataPaths,
    manifest: &Manifest,
    product_name: &str,
    cohort_name: &str,
) -> Result<(), ProvisionError> {
    let tool_config: ToolConfig = read_document(&paths.tool_config_file())?;
    let active = tool_config.require_profile()?;
    let hierarchy = TrustHierarchy::new(paths);

    let cohort_spec = manifest
        .cohorts
        .iter()
        .find(|c| c.name == cohort_name)
        .ok_or_else(|| ProvisionError::UnknownCohort(cohort_name.to_string()))?;

    let product = ensure(
        client,
        &ResourceRequest::product(&active.organization_prn, product_name),
    )?;
    let cohort = ensure(
        client,
        &ResourceRequest::cohort(
            &active.organization_prn,
            &product.prn,
            &cohort_spec.name,
            &cohort_spec.description,
        ),
    )?;
    let intermediate = hierarchy.ensure_intermediate_ca(product_name, cohort_name)?;

    // First boot reports the seed release until the device checks in.
    let seed_version = manifest
        .releases
        .first()
        .map_or("0.0.0", |release| release.version.as_str());

    for device in &manifest.devices {
        info!(device = %device.identifier, "provisioning device environment");
        let device_dir = paths.device_dir(&device.identifier);
        create_dir(&device_dir)?;

        let mut env = BootEnvironment::new();
        env.set(ENV_KEY_RELEASE_PRN, SEED_RELEASE_PRN)?;
        env.set(ENV_KEY_RELEASE_VERSION, seed_version)?;
        let block = env.encode(BOOT_ENV_BLOCK_SIZE)?;
        write_file(&device_dir.join("uboot.env"), &block)?;

        write_file(&device_dir.join("fw_env.config"), FW_ENV_CONFIG.as_bytes())?;
        write_file(
            &device_dir.join("fleetd.json"),
            serde_json::to_string_pretty(&node_config())
                .unwrap_or_default()
                .as_bytes(),
        )?;

        let hooks_dir = device_dir.join("hooks");
        create_dir(&hooks_dir)?;
        write_executable(&hooks_dir.join("pre-up.sh"), RAT_PRE_UP)?;
        write_executable(&hooks_dir.join("pre-down.sh"), RAT_PRE_DOWN)?;

        let certificate = hierarchy.ensure_device_certificate(&device.identifier, &intermediate)?;

        ensure(
            client,
            &ResourceRequest::device(
                &active.organization_prn,
                product_name,
                &cohort.prn,
                &device.identifier,
                &device.target,
                &device.tags,
            ),
        )?;
        ensure(
            client,
            &ResourceRequest::device_certificate(
                &active.organization_prn,
                product_name,
                &device.identifier,
                &certificate.certificate_path.display().to_string(),
            ),
        )?;
    }
    Ok(())
}

/// Publish-release flow: ensure every artifact, artifact version, payload,
/// and signed binary of each bundle, the bundle itself, and finally the
/// releases binding bundles to the cohort with their phase policy.
///
/// # Errors
///
/// Fails on the first control-plane rejection or local write failure.
pub fn publish_release(
    client: &dyn ControlPlane,
    paths: &DataPaths,
    manifest: &Manifest,
    product_name: &str,
    cohort_name: &str,
) -> Result<(), ProvisionError> {
    let tool_config: ToolConfig = read_document(&paths.tool_config_file())?;
    let active = tool_config.require_profile()?;

    let cohort_spec = manifest
        .cohorts
        .iter()
        .find(|c| c.name == cohort_name)
        .ok_or_else(|| ProvisionError::UnknownCohort(cohort_name.to_string()))?;

    let product = ensure(
        client,
        &ResourceRequest::product(&active.organization_prn, product_name),
    )?;
    let cohort = ensure(
        client,
        &ResourceRequest::cohort(
            &active.organization_prn,
            &product.prn,
            &cohort_spec.name,
            &cohort_spec.description,
        ),
    )?;
    let signing_key_pair = format!("{cohort_name}-signing-key");

    for release in &manifest.releases {
        let bundle_spec = manifest
            .bundle(&release.bundle)
            .ok_or_else(|| ProvisionError::UnknownBundle(release.bundle.clone()))?;
        let bundle_prn = ensure_bundle(
            client,
            paths,
            &active.organization_prn,
            bundle_spec,
            &signing_key_pair,
        )?;

        info!(release = %release.name, bundle = %release.bundle, "ensuring release");
        let schedule_date = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        ensure(
            client,
            &ResourceRequest::release(
                &active.organization_prn,
                &cohort.prn,
                &bundle_prn,
                &release.name,
                &release.version,
                &release.version_requirement,
                release.disabled,
                &schedule_date,
                &RolloutPhase::from_tags(&release.phase_tags),
            ),
        )?;
    }
    Ok(())
}

/// Ensure one bundle: its artifacts, artifact versions, payload files, and
/// signed binaries, then the bundle referencing every artifact version.
fn ensure_bundle(
    client: &dyn ControlPlane,
    paths: &DataPaths,
    organization_prn: &str,
    bundle: &BundleSpec,
    signing_key_pair: &str,
) -> Result<String, ProvisionError> {
    let mut artifact_version_prns = Vec::with_capacity(bundle.artifacts.len());

    for artifact in &bundle.artifacts {
        debug!(artifact = %artifact.name, version = %artifact.version, "ensuring artifact");
        let artifact_handle = ensure(
            client,
            &ResourceRequest::artifact(organization_prn, &artifact.name, &artifact.description),
        )?;
        let version_handle = ensure(
            client,
            &ResourceRequest::artifact_version(
                organization_prn,
                &artifact_handle.prn,
                &artifact.version,
            ),
        )?;

        for target in &artifact.targets {
            let payload =
                paths.artifact_payload(&artifact.name, &artifact.version, &target.target);
            ensure_payload(&payload, target.bytes)?;
            ensure(
                client,
                &ResourceRequest::binary(
                    organization_prn,
                    &version_handle.prn,
                    &target.target,
                    &payload.display().to_string(),
                    signing_key_pair,
                ),
            )?;
        }
        artifact_version_prns.push(version_handle.prn);
    }

    let bundle_handle = ensure(
        client,
        &ResourceRequest::bundle(organization_prn, &bundle.name, &artifact_version_prns),
    )?;
    Ok(bundle_handle.prn)
}

/// Generate (or reuse) a payload file of the declared size. Content is
/// random; only the size matters to the evaluation kit.
fn ensure_payload(path: &Path, bytes: u64) -> Result<(), ProvisionError> {
    if path.exists() {
        debug!(path = %path.display(), "payload already exists");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    info!(path = %path.display(), bytes, "generating payload");

    let mut rng = rand::thread_rng();
    let mut remaining = bytes;
    let mut chunk = vec![0u8; 64 * 1024];
    let mut content = Vec::with_capacity(usize::try_from(bytes).unwrap_or(0));
    while remaining > 0 {
        let take = usize::try_from(remaining.min(chunk.len() as u64)).unwrap_or(chunk.len());
        rng.fill_bytes(&mut chunk[..take]);
        content.extend_from_slice(&chunk[..take]);
        remaining -= take as u64;
    }
    write_file(path, &content)
}

/// Device node configuration consumed by the on-device agent.
fn node_config() -> Value {
    json!({
        "version": 1,
        "fwup": {
            "devpath": "/etc/fleetd/fleetd.fwup.img",
        },
        "remote_shell": true,
        "remote_access_tunnels": {
            "enabled": true,
            "service_ports": [22],
            "hooks": {
                "pre_up": "/etc/fleetd/hooks/pre-up.sh",
                "pre_down": "/etc/fleetd/hooks/pre-down.sh",
            },
        },
        "node": {
            "key_pair_source": "env",
            "key_pair_config": {
                "private_key": "FLEETD_PRIVATE_KEY",
                "certificate": "FLEETD_CERTIFICATE",
            },
        },
    })
}

fn cli_args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn create_dir(path: &Path) -> Result<(), ProvisionError> {
    fs::create_dir_all(path).map_err(|source| ProvisionError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), ProvisionError> {
    fs::write(path, content).map_err(|source| ProvisionError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn write_executable(path: &Path, content: &str) -> Result<(), ProvisionError> {
    write_file(path, content.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
            ProvisionError::Write {
                path: path.display().to_string(),
                source,
            }
        })?;
    }
    Ok(())
}
