//! Resource reconciliation against the control plane.
//!
//! The control plane offers create/list/get verbs per resource kind with no
//! batch API and no idempotency keys; create fails with a uniqueness
//! conflict when the resource already exists. [`ensure`] is the single
//! idempotency primitive layered on top: attempt the create, and on a
//! uniqueness conflict fall back to a list scoped by organization and the
//! resource's natural key, returning the first match. Any other failure
//! propagates. The same prn comes back whether the resource was just
//! created or already existed.
//!
//! Each resource kind is described by a [`ResourceRequest`]: the create and
//! list argument vectors for the vendor CLI plus the JSON pointers locating
//! the resource in either response shape. Callers own the precision of the
//! natural-key search predicate.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Outcome of one vendor CLI invocation.
#[derive(Debug, Clone)]
pub struct CliResponse {
    /// Whether the process exited successfully.
    pub success: bool,
    /// Raw stdout (JSON on success).
    pub stdout: String,
    /// Raw stderr (machine-parsable error shape on failure).
    pub stderr: String,
}

/// Errors raised while invoking the control-plane client itself.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// The vendor CLI executable is not installed.
    #[error(
        "control-plane CLI `{program}` not found; install the fleethub CLI \
         and ensure it is on the PATH"
    )]
    ToolUnavailable { program: String },

    /// Spawning or reading from the process failed.
    #[error("failed to invoke control-plane CLI: {0}")]
    Io(#[from] std::io::Error),
}

/// Client for the remote control plane, authenticated by a named profile.
pub trait ControlPlane {
    /// Run one verb (`args` excludes the program name and profile flags).
    ///
    /// # Errors
    ///
    /// Returns an error only when the client itself cannot run; a failing
    /// remote call is reported through [`CliResponse::success`].
    fn invoke(&self, args: &[String]) -> Result<CliResponse, ControlPlaneError>;
}

/// Errors from reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// Create failed for a reason other than a uniqueness conflict, or the
    /// fallback list failed.
    #[error("{kind} `{natural_key}` rejected by control plane: {detail}")]
    Rejected {
        kind: &'static str,
        natural_key: String,
        detail: String,
    },

    /// The control plane reported a conflict but the scoped lookup returned
    /// no match, which means the natural-key predicate is inconsistent.
    #[error("{kind} `{natural_key}` reported as existing but lookup found no match")]
    NotFoundAfterConflict {
        kind: &'static str,
        natural_key: String,
    },

    /// Response was not the JSON shape the client documents.
    #[error("malformed {kind} response from control plane: {detail}")]
    MalformedResponse {
        kind: &'static str,
        detail: String,
    },
}

/// Stable reference to a remote resource.
#[derive(Debug, Clone)]
pub struct Handle {
    /// Opaque resource identifier, stable across calls.
    pub prn: String,
    /// Full attribute record as returned by the control plane.
    pub raw: Value,
}

/// Descriptor for one `ensure` call.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Resource kind, for logging and error reporting.
    pub kind: &'static str,
    /// Natural key within the organization scope.
    pub natural_key: String,
    /// Vendor CLI argument vector for the create verb.
    pub create_args: Vec<String>,
    /// Vendor CLI argument vector for the scoped list fallback.
    pub list_args: Vec<String>,
    /// JSON pointer to the created resource object in the create response.
    pub created_pointer: String,
    /// JSON pointer to the match array in the list response.
    pub listed_pointer: String,
}

/// Ensure a remote resource exists and return its handle.
///
/// # Errors
///
/// Propagates client failures, non-conflict rejections, and an empty lookup
/// after a conflict (see [`ReconcileError`]).
pub fn ensure(
    client: &dyn ControlPlane,
    request: &ResourceRequest,
) -> Result<Handle, ReconcileError> {
    debug!(kind = request.kind, key = %request.natural_key, "ensuring resource");
    let response = client.invoke(&request.create_args)?;
    if response.success {
        let handle = parse_handle(request, &response.stdout, &request.created_pointer)?;
        info!(kind = request.kind, key = %request.natural_key, prn = %handle.prn, "created");
        return Ok(handle);
    }

    if !is_uniqueness_conflict(&response.stderr) {
        return Err(ReconcileError::Rejected {
            kind: request.kind,
            natural_key: request.natural_key.clone(),
            detail: response.stderr.trim().to_string(),
        });
    }

    debug!(kind = request.kind, key = %request.natural_key, "already exists, looking up");
    let response = client.invoke(&request.list_args)?;
    if !response.success {
        return Err(ReconcileError::Rejected {
            kind: request.kind,
            natural_key: request.natural_key.clone(),
            detail: response.stderr.trim().to_string(),
        });
    }

    let listed = lookup_value(request, &response.stdout, &request.listed_pointer)?;
    let first = listed
        .as_array()
        .and_then(|matches| matches.first())
        .ok_or_else(|| ReconcileError::NotFoundAfterConflict {
            kind: request.kind,
            natural_key: request.natural_key.clone(),
        })?;
    let handle = handle_from_value(request, first)?;
    info!(kind = request.kind, key = %request.natural_key, prn = %handle.prn, "reused existing");
    Ok(handle)
}

/// Whether an error body is a uniqueness conflict.
///
/// The control plane reports validation failures as
/// `{"data": {"params": {"<field>": ["has already been taken"]}}}` with the
/// message attached to the field that triggered the conflict.
fn is_uniqueness_conflict(stderr: &str) -> bool {
    let Ok(body) = serde_json::from_str::<Value>(stderr.trim()) else {
        return false;
    };
    let Some(params) = body.pointer("/data/params").and_then(Value::as_object) else {
        return false;
    };
    params.values().any(field_reports_taken)
}

fn field_reports_taken(field: &Value) -> bool {
    match field {
        Value::String(message) => message.contains("has already been taken"),
        Value::Array(messages) => messages.iter().any(field_reports_taken),
        _ => false,
    }
}

fn lookup_value(
    request: &ResourceRequest,
    stdout: &str,
    pointer: &str,
) -> Result<Value, ReconcileError> {
    let body: Value =
        serde_json::from_str(stdout).map_err(|e| ReconcileError::MalformedResponse {
            kind: request.kind,
            detail: e.to_string(),
        })?;
    let value = body
        .pointer(pointer)
        .ok_or_else(|| ReconcileError::MalformedResponse {
            kind: request.kind,
            detail: format!("missing {pointer}"),
        })?;
    Ok(value.clone())
}

fn parse_handle(
    request: &ResourceRequest,
    stdout: &str,
    pointer: &str,
) -> Result<Handle, ReconcileError> {
    let value = lookup_value(request, stdout, pointer)?;
    handle_from_value(request, &value)
}

fn handle_from_value(request: &ResourceRequest, value: &Value) -> Result<Handle, ReconcileError> {
    let prn = value
        .get("prn")
        .and_then(Value::as_str)
        .ok_or_else(|| ReconcileError::MalformedResponse {
            kind: request.kind,
            detail: "resource record has no prn".to_string(),
        })?;
    Ok(Handle {
        prn: prn.to_string(),
        raw: value.clone(),
    })
}

/// Search predicate scoped by organization plus one key field.
fn scoped_search(organization_prn: &str, field: &str, value: &str) -> String {
    format!("organization_prn:'{organization_prn}' and {field}:'{value}'")
}

impl ResourceRequest {
    /// Product, keyed by name.
    #[must_use]
    pub fn product(organization_prn: &str, name: &str) -> Self {
        Self {
            kind: "product",
            natural_key: name.to_string(),
            create_args: args([
                "products-v2",
                "create",
                "--name",
                name,
                "--organization-prn",
                organization_prn,
            ]),
            list_args: args([
                "products-v2",
                "list",
                "--search",
                &scoped_search(organization_prn, "name", name),
            ]),
            created_pointer: "/data/product".to_string(),
            listed_pointer: "/products".to_string(),
        }
    }

    /// Cohort, keyed by name within a product.
    #[must_use]
    pub fn cohort(organization_prn: &str, product_prn: &str, name: &str, description: &str) -> Self {
        Self {
            kind: "cohort",
            natural_key: name.to_string(),
            create_args: args([
                "cohorts",
                "create",
                "--name",
                name,
                "--description",
                description,
                "--organization-prn",
                organization_prn,
                "--product-prn",
                product_prn,
            ]),
            list_args: args([
                "cohorts",
                "list",
                "--search",
                &scoped_search(organization_prn, "name", name),
            ]),
            created_pointer: "/data/cohort".to_string(),
            listed_pointer: "/cohorts".to_string(),
        }
    }

    /// Device, keyed by identifier.
    #[must_use]
    pub fn device(
        organization_prn: &str,
        product_name: &str,
        cohort_prn: &str,
        identifier: &str,
        target: &str,
        tags: &[String],
    ) -> Self {
        Self {
            kind: "device",
            natural_key: identifier.to_string(),
            create_args: args([
                "devices",
                "create",
                "--identifier",
                identifier,
                "--product-name",
                product_name,
                "--cohort-prn",
                cohort_prn,
                "--tags",
                &tags.join(" "),
                "--target",
                target,
            ]),
            list_args: args([
                "devices",
                "list",
                "--search",
                &scoped_search(organization_prn, "identifier", identifier),
            ]),
            created_pointer: "/data/device".to_string(),
            listed_pointer: "/devices".to_string(),
        }
    }

    /// Device certificate, keyed by the owning device identifier.
    #[must_use]
    pub fn device_certificate(
        organization_prn: &str,
        product_name: &str,
        identifier: &str,
        certificate_path: &str,
    ) -> Self {
        Self {
            kind: "device-certificate",
            natural_key: identifier.to_string(),
            create_args: args([
                "device-certificates",
                "create",
                "--device-identifier",
                identifier,
                "--product-name",
                product_name,
                "--certificate-path",
                certificate_path,
            ]),
            list_args: args([
                "device-certificates",
                "list",
                "--search",
                &scoped_search(organization_prn, "device_identifier", identifier),
            ]),
            created_pointer: "/data/device_certificate".to_string(),
            listed_pointer: "/device_certificates".to_string(),
        }
    }

    /// Signing key, keyed by its base64 raw public key value.
    #[must_use]
    pub fn signing_key(organization_prn: &str, name: &str, public_key_b64: &str) -> Self {
        Self {
            kind: "signing-key",
            natural_key: name.to_string(),
            create_args: args([
                "signing-keys",
                "create",
                "--organization-prn",
                organization_prn,
                "--value",
                public_key_b64,
                "--name",
                name,
            ]),
            list_args: args([
                "signing-keys",
                "list",
                "--search",
                &scoped_search(organization_prn, "value", public_key_b64),
            ]),
            created_pointer: "/data/signing_key".to_string(),
            listed_pointer: "/signing_keys".to_string(),
        }
    }

    /// Artifact, keyed by name.
    #[must_use]
    pub fn artifact(organization_prn: &str, name: &str, description: &str) -> Self {
        Self {
            kind: "artifact",
            natural_key: name.to_string(),
            create_args: args([
                "artifacts",
                "create",
                "--organization-prn",
                organization_prn,
                "--name",
                name,
                "--description",
                description,
            ]),
            list_args: args([
                "artifacts",
                "list",
                "--search",
                &scoped_search(organization_prn, "name", name),
            ]),
            created_pointer: "/data/artifact".to_string(),
            listed_pointer: "/artifacts".to_string(),
        }
    }

    /// Artifact version, keyed by (artifact prn, version description).
    #[must_use]
    pub fn artifact_version(organization_prn: &str, artifact_prn: &str, version: &str) -> Self {
        Self {
            kind: "artifact-version",
            natural_key: format!("{artifact_prn}@{version}"),
            create_args: args([
                "artifact-versions",
                "create",
                "--artifact-prn",
                artifact_prn,
                "--version",
                version,
                "--description",
                version,
            ]),
            list_args: args([
                "artifact-versions",
                "list",
                "--search",
                &format!(
                    "organization_prn:'{organization_prn}' and \
                     artifact_prn:'{artifact_prn}' and description:'{version}'"
                ),
            ]),
            created_pointer: "/data/artifact_version".to_string(),
            listed_pointer: "/artifact_versions".to_string(),
        }
    }

    /// Binary, keyed by (artifact version prn, target); content is uploaded
    /// from the payload path and signed with the named key pair.
    #[must_use]
    pub fn binary(
        organization_prn: &str,
        artifact_version_prn: &str,
        target: &str,
        content_path: &str,
        signing_key_pair: &str,
    ) -> Self {
        Self {
            kind: "binary",
            natural_key: format!("{artifact_version_prn}/{target}"),
            create_args: args([
                "binaries",
                "create",
                "--artifact-version-prn",
                artifact_version_prn,
                "--target",
                target,
                "--content-path",
                content_path,
                "--signing-key-pair",
                signing_key_pair,
            ]),
            list_args: args([
                "binaries",
                "list",
                "--search",
                &format!(
                    "organization_prn:'{organization_prn}' and \
                     artifact_version_prn:'{artifact_version_prn}' and target:'{target}'"
                ),
            ]),
            created_pointer: "/data/binary".to_string(),
            listed_pointer: "/binaries".to_string(),
        }
    }

    /// Bundle, keyed by name.
    #[must_use]
    pub fn bundle(organization_prn: &str, name: &str, artifact_version_prns: &[String]) -> Self {
        Self {
            kind: "bundle",
            natural_key: name.to_string(),
            create_args: args([
                "bundles",
                "create",
                "--artifact-version-prns",
                &artifact_version_prns.join(" "),
                "--name",
                name,
                "--organization-prn",
                organization_prn,
            ]),
            list_args: args([
                "bundles",
                "list",
                "--search",
                &scoped_search(organization_prn, "name", name),
            ]),
            created_pointer: "/data/bundle".to_string(),
            listed_pointer: "/bundles".to_string(),
        }
    }

    /// Release, keyed by name. `phase` selects between a full rollout and a
    /// tag-scoped phase.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn release(
        organization_prn: &str,
        cohort_prn: &str,
        bundle_prn: &str,
        name: &str,
        version: &str,
        version_requirement: &str,
        disabled: bool,
        schedule_date: &str,
        phase: &RolloutPhase,
    ) -> Self {
        let mut create_args = args([
            "releases",
            "create",
            "--organization-prn",
            organization_prn,
            "--bundle-prn",
            bundle_prn,
            "--cohort-prn",
            cohort_prn,
            "--name",
            name,
            "--schedule-date",
            schedule_date,
            "--disabled",
            if disabled { "true" } else { "false" },
            "--version",
            version,
            "--version-requirement",
            version_requirement,
        ]);
        match phase {
            RolloutPhase::Full => {
                create_args.push("--phase-value".to_string());
                create_args.push("1.0".to_string());
            }
            RolloutPhase::Tags(tags) => {
                create_args.push("--phase-tags".to_string());
                create_args.push(tags.join(" "));
            }
        }
        Self {
            kind: "release",
            natural_key: name.to_string(),
            create_args,
            list_args: args([
                "releases",
                "list",
                "--search",
                &scoped_search(organization_prn, "name", name),
            ]),
            created_pointer: "/data/release".to_string(),
            listed_pointer: "/releases".to_string(),
        }
    }
}

/// Progressive-rollout phase policy for a release.
#[derive(Debug, Clone)]
pub enum RolloutPhase {
    /// 100% rollout.
    Full,
    /// Rollout scoped to devices carrying any of these tags.
    Tags(Vec<String>),
}

impl RolloutPhase {
    /// An empty tag list means a full rollout.
    #[must_use]
    pub fn from_tags(tags: &[String]) -> Self {
        if tags.is_empty() {
            Self::Full
        } else {
            Self::Tags(tags.to_vec())
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}
