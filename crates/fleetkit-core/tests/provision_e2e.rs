//! End-to-end provisioning flows against an in-memory control plane.
//!
//! The fake control plane mirrors the vendor CLI contract: create succeeds
//! once and reports a uniqueness conflict afterwards, list answers scoped
//! search predicates, and CA certificates are indexed by serial. Every flow
//! is run twice to prove idempotency: the second run must create nothing
//! remotely and rewrite nothing locally.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fleetkit_core::manifest::{
    ArtifactSpec, BundleSpec, CohortSpec, DeviceSpec, Manifest, ReleaseSpec, TargetSpec,
};
use fleetkit_core::paths::DataPaths;
use fleetkit_core::pki;
use fleetkit_core::provision;
use fleetkit_core::reconcile::{CliResponse, ControlPlane, ControlPlaneError};

const ORG_PRN: &str = "prn:1:org:test";

#[derive(Debug, Clone)]
struct Record {
    prn: String,
    fields: Vec<String>,
}

#[derive(Default)]
struct FakePlane {
    resources: RefCell<BTreeMap<String, Vec<Record>>>,
    registered_serials: RefCell<Vec<String>>,
    verification_codes_issued: RefCell<u32>,
    calls: RefCell<Vec<Vec<String>>>,
}

impl FakePlane {
    fn new() -> Self {
        Self::default()
    }

    fn created_total(&self) -> usize {
        self.resources.borrow().values().map(Vec::len).sum::<usize>()
            + self.registered_serials.borrow().len()
    }

    fn created(&self, kind: &str) -> usize {
        self.resources.borrow().get(kind).map_or(0, Vec::len)
    }

    fn ok(stdout: String) -> CliResponse {
        CliResponse {
            success: true,
            stdout,
            stderr: String::new(),
        }
    }

    fn conflict(field: &str) -> CliResponse {
        CliResponse {
            success: false,
            stdout: String::new(),
            stderr: format!(r#"{{"data":{{"params":{{"{field}":["has already been taken"]}}}}}}"#),
        }
    }

    fn failure(detail: &str) -> CliResponse {
        CliResponse {
            success: false,
            stdout: String::new(),
            stderr: format!(r#"{{"data":{{"errors":["{detail}"]}}}}"#),
        }
    }

    /// `(singular, plural, key flags)` per CLI resource noun.
    fn kind_info(resource: &str) -> (&'static str, &'static str, &'static [&'static str]) {
        match resource {
            "products-v2" => ("product", "products", &["--name"]),
            "cohorts" => ("cohort", "cohorts", &["--name", "--product-prn"]),
            "devices" => ("device", "devices", &["--identifier"]),
            "device-certificates" => (
                "device_certificate",
                "device_certificates",
                &["--device-identifier"],
            ),
            "signing-keys" => ("signing_key", "signing_keys", &["--value"]),
            "artifacts" => ("artifact", "artifacts", &["--name"]),
            "artifact-versions" => (
                "artifact_version",
                "artifact_versions",
                &["--artifact-prn", "--version"],
            ),
            "binaries" => ("binary", "binaries", &["--artifact-version-prn", "--target"]),
            "bundles" => ("bundle", "bundles", &["--name"]),
            "releases" => ("release", "releases", &["--name"]),
            other => panic!("unexpected resource noun {other}"),
        }
    }

    fn flags(args: &[String]) -> BTreeMap<String, String> {
        let mut flags = BTreeMap::new();
        let mut i = 0;
        while i < args.len() {
            if args[i].starts_with("--") && i + 1 < args.len() {
                flags.insert(args[i].clone(), args[i + 1].clone());
                i += 2;
            } else {
                i += 1;
            }
        }
        flags
    }

    fn handle_create(&self, resource: &str, args: &[String]) -> CliResponse {
        let (singular, _, key_flags) = Self::kind_info(resource);
        let flags = Self::flags(args);
        let key: Vec<String> = key_flags
            .iter()
            .map(|flag| flags.get(*flag).cloned().unwrap_or_default())
            .collect();
        let key = key.join("/");

        let mut resources = self.resources.borrow_mut();
        let records = resources.entry(singular.to_string()).or_default();
        if records.iter().any(|r| r.fields.contains(&key)) {
            let field = key_flags
                .last()
                .unwrap()
                .trim_start_matches("--")
                .replace('-', "_");
            return Self::conflict(&field);
        }

        let prn = format!("prn:1:{singular}:{}", records.len() + 1);
        let mut fields: Vec<String> = flags.values().cloned().collect();
        fields.push(key);
        records.push(Record {
            prn: prn.clone(),
            fields,
        });
        Self::ok(format!(
            r#"{{"data":{{"{singular}":{{"prn":"{prn}"}}}}}}"#
        ))
    }

    fn handle_list(&self, resource: &str, args: &[String]) -> CliResponse {
        let (singular, plural, _) = Self::kind_info(resource);
        let flags = Self::flags(args);
        let search = flags.get("--search").cloned().unwrap_or_default();
        let wanted: Vec<String> = search
            .split('\'')
            .skip(1)
            .step_by(2)
            .filter(|value| *value != ORG_PRN)
            .map(ToString::to_string)
            .collect();

        let resources = self.resources.borrow();
        let matches: Vec<String> = resources
            .get(singular)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| wanted.iter().all(|w| r.fields.contains(w)))
                    .map(|r| format!(r#"{{"prn":"{}"}}"#, r.prn))
                    .collect()
            })
            .unwrap_or_default();

        Self::ok(format!(r#"{{"{plural}":[{}]}}"#, matches.join(",")))
    }

    fn handle_ca_certificates(&self, args: &[String]) -> CliResponse {
        match args[1].as_str() {
            "get" => {
                let flags = Self::flags(args);
                let serial = flags
                    .get("--ca-certificate-serial")
                    .cloned()
                    .unwrap_or_default();
                if self.registered_serials.borrow().contains(&serial) {
                    Self::ok(format!(
                        r#"{{"data":{{"ca_certificate":{{"serial":"{serial}"}}}}}}"#
                    ))
                } else {
                    Self::failure("ca certificate not found")
                }
            }
            "create-verification-code" => {
                let mut issued = self.verification_codes_issued.borrow_mut();
                *issued += 1;
                Self::ok(format!(
                    r#"{{"data":{{"verification_code":"VC-{:04}"}}}}"#,
                    *issued
                ))
            }
            "create" => {
                let flags = Self::flags(args);
                let cert_path = flags.get("--certificate-path").cloned().unwrap_or_default();
                let serial = pki::read_serial_number(Path::new(&cert_path))
                    .expect("fake control plane could not parse registered certificate");
                self.registered_serials.borrow_mut().push(serial);
                Self::ok(r#"{"data":{"ca_certificate":{"prn":"prn:1:ca_certificate:1"}}}"#.to_string())
            }
            other => panic!("unexpected ca-certificates verb {other}"),
        }
    }
}

impl ControlPlane for FakePlane {
    fn invoke(&self, args: &[String]) -> Result<CliResponse, ControlPlaneError> {
        self.calls.borrow_mut().push(args.to_vec());
        let response = match args[0].as_str() {
            "users" => Self::ok(r#"{"data":{"user":{"username":"eng"}}}"#.to_string()),
            "ca-certificates" => self.handle_ca_certificates(args),
            resource => match args[1].as_str() {
                "create" => self.handle_create(resource, args),
                "list" => self.handle_list(resource, args),
                other => panic!("unexpected verb {other} for {resource}"),
            },
        };
        Ok(response)
    }
}

/// Two cohorts and tiny payloads keep the flows fast while exercising every
/// resource kind.
fn test_manifest() -> Manifest {
    Manifest {
        devices: vec![
            DeviceSpec {
                identifier: "EK-IOT-0001".to_string(),
                target: "arm64-v8".to_string(),
                tags: vec!["canary".to_string()],
            },
            DeviceSpec {
                identifier: "EK-IOT-0002".to_string(),
                target: "arm64-v8".to_string(),
                tags: Vec::new(),
            },
        ],
        cohorts: vec![
            CohortSpec {
                name: "release".to_string(),
                description: "stable".to_string(),
            },
            CohortSpec {
                name: "daily-debug".to_string(),
                description: "daily developer builds".to_string(),
            },
        ],
        bundles: vec![BundleSpec {
            name: "r1001".to_string(),
            artifacts: vec![ArtifactSpec {
                name: "edge-sense-os".to_string(),
                description: "Edge Sense Product OS".to_string(),
                version: "v1.0.0".to_string(),
                targets: vec![
                    TargetSpec {
                        target: "arm64-v8".to_string(),
                        bytes: 2048,
                    },
                    TargetSpec {
                        target: "x86_64".to_string(),
                        bytes: 1024,
                    },
                ],
            }],
        }],
        releases: vec![
            ReleaseSpec {
                name: "release-r1001".to_string(),
                bundle: "r1001".to_string(),
                version: "1.0.0".to_string(),
                version_requirement: String::new(),
                disabled: false,
                phase_tags: Vec::new(),
            },
            ReleaseSpec {
                name: "release-r1001-canary".to_string(),
                bundle: "r1001".to_string(),
                version: "1.0.1".to_string(),
                version_requirement: "~> 1.0".to_string(),
                disabled: true,
                phase_tags: vec!["canary".to_string()],
            },
        ],
    }
}

fn configure(plane: &FakePlane, paths: &DataPaths) {
    provision::configure(plane, paths, "acme", ORG_PRN, "api-key-123").unwrap();
}

/// Recursive (path, length, mtime) snapshot of everything under the config
/// directory.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, (u64, SystemTime)> {
    fn walk(dir: &Path, out: &mut BTreeMap<PathBuf, (u64, SystemTime)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else {
                let meta = entry.metadata().unwrap();
                out.insert(path, (meta.len(), meta.modified().unwrap()));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, &mut out);
    out
}

#[test]
fn create_product_builds_the_full_hierarchy() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = DataPaths::at(tmp.path());
    let plane = FakePlane::new();
    let manifest = test_manifest();

    configure(&plane, &paths);
    provision::create_product(&plane, &paths, &manifest, "acme-widget").unwrap();

    assert_eq!(plane.created("product"), 1);
    assert_eq!(plane.created("cohort"), 2);
    assert_eq!(plane.created("signing_key"), 2);
    assert_eq!(plane.registered_serials.borrow().len(), 2);

    // Both intermediates chain to the one shared root.
    let root_cert = paths.root_ca_cert();
    assert!(root_cert.exists());
    for cohort in &manifest.cohorts {
        let dir = paths.intermediate_ca_dir("acme-widget", &cohort.name);
        assert!(dir.join("intermediate-certificate.pem").exists());
        assert!(dir.join("verification-certificate.pem").exists());
    }

    // Distinct signing key pairs per cohort.
    let release_key =
        pki::raw_public_key_bytes(&paths.signing_keys_dir().join("release-public-key.pem"))
            .unwrap();
    let debug_key =
        pki::raw_public_key_bytes(&paths.signing_keys_dir().join("daily-debug-public-key.pem"))
            .unwrap();
    assert_ne!(release_key, debug_key);

    // Keychain config records both pairs.
    let cli_config: fleetkit_core::config::CliConfig =
        fleetkit_core::config::read_document(&paths.cli_config_file()).unwrap();
    assert!(cli_config.signing_key_pairs.contains_key("release-signing-key"));
    assert!(cli_config.signing_key_pairs.contains_key("daily-debug-signing-key"));
}

#[test]
fn create_product_rerun_creates_and_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = DataPaths::at(tmp.path());
    let plane = FakePlane::new();
    let manifest = test_manifest();

    configure(&plane, &paths);
    provision::create_product(&plane, &paths, &manifest, "acme-widget").unwrap();

    let created_before = plane.created_total();
    let codes_before = *plane.verification_codes_issued.borrow();
    let files_before = snapshot(tmp.path());

    provision::create_product(&plane, &paths, &manifest, "acme-widget").unwrap();

    assert_eq!(plane.created_total(), created_before);
    assert_eq!(*plane.verification_codes_issued.borrow(), codes_before);
    assert_eq!(snapshot(tmp.path()), files_before);
}

#[test]
fn register_devices_materializes_environments_and_identities() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = DataPaths::at(tmp.path());
    let plane = FakePlane::new();
    let manifest = test_manifest();

    configure(&plane, &paths);
    provision::create_product(&plane, &paths, &manifest, "acme-widget").unwrap();
    provision::register_devices(&plane, &paths, &manifest, "acme-widget", "release").unwrap();

    assert_eq!(plane.created("device"), 2);
    assert_eq!(plane.created("device_certificate"), 2);

    for device in &manifest.devices {
        let dir = paths.device_dir(&device.identifier);
        let block = std::fs::read(dir.join("uboot.env")).unwrap();
        assert_eq!(block.len(), provision::BOOT_ENV_BLOCK_SIZE);
        let env = fleetkit_core::envblock::BootEnvironment::decode(&block).unwrap();
        assert_eq!(env.get(provision::ENV_KEY_RELEASE_VERSION), Some("1.0.0"));
        assert!(env.get(provision::ENV_KEY_RELEASE_PRN).is_some());

        assert!(dir.join("fw_env.config").exists());
        assert!(dir.join("fleetd.json").exists());
        assert!(dir.join("hooks/pre-up.sh").exists());
        assert!(dir.join("hooks/pre-down.sh").exists());
        assert!(dir.join("device-certificate.pem").exists());
    }

    // Re-run: nothing new remotely, certificates untouched.
    let cert = std::fs::read(paths.device_dir("EK-IOT-0001").join("device-certificate.pem"))
        .unwrap();
    let created_before = plane.created_total();
    provision::register_devices(&plane, &paths, &manifest, "acme-widget", "release").unwrap();
    assert_eq!(plane.created_total(), created_before);
    assert_eq!(
        std::fs::read(paths.device_dir("EK-IOT-0001").join("device-certificate.pem")).unwrap(),
        cert
    );
}

#[test]
fn publish_release_ensures_bundles_binaries_and_phases() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = DataPaths::at(tmp.path());
    let plane = FakePlane::new();
    let manifest = test_manifest();

    configure(&plane, &paths);
    provision::create_product(&plane, &paths, &manifest, "acme-widget").unwrap();
    provision::publish_release(&plane, &paths, &manifest, "acme-widget", "release").unwrap();

    assert_eq!(plane.created("artifact"), 1);
    assert_eq!(plane.created("artifact_version"), 1);
    assert_eq!(plane.created("binary"), 2);
    assert_eq!(plane.created("bundle"), 1);
    assert_eq!(plane.created("release"), 2);

    // Payload files carry the declared sizes.
    let os_arm = paths.artifact_payload("edge-sense-os", "v1.0.0", "arm64-v8");
    let os_x86 = paths.artifact_payload("edge-sense-os", "v1.0.0", "x86_64");
    assert_eq!(std::fs::metadata(&os_arm).unwrap().len(), 2048);
    assert_eq!(std::fs::metadata(&os_x86).unwrap().len(), 1024);

    // Phase policy: the untagged release rolls out fully, the tagged one is
    // scoped to its tags.
    let calls = plane.calls.borrow();
    let release_creates: Vec<&Vec<String>> = calls
        .iter()
        .filter(|c| c[0] == "releases" && c[1] == "create")
        .collect();
    assert_eq!(release_creates.len(), 2);
    assert!(release_creates[0].contains(&"--phase-value".to_string()));
    assert!(release_creates[0].contains(&"1.0".to_string()));
    assert!(release_creates[1].contains(&"--phase-tags".to_string()));
    assert!(release_creates[1].contains(&"canary".to_string()));
    drop(calls);

    // Re-run creates nothing and reuses the payload bytes.
    let payload = std::fs::read(&os_arm).unwrap();
    let created_before = plane.created_total();
    provision::publish_release(&plane, &paths, &manifest, "acme-widget", "release").unwrap();
    assert_eq!(plane.created_total(), created_before);
    assert_eq!(std::fs::read(&os_arm).unwrap(), payload);
}

#[test]
fn commands_before_configure_fail_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = DataPaths::at(tmp.path());
    let plane = FakePlane::new();
    let manifest = test_manifest();

    let err = provision::create_product(&plane, &paths, &manifest, "acme-widget").unwrap_err();
    assert!(err.to_string().contains("no profile configured"));
}
