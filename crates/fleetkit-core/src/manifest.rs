//! Declarative provisioning manifest.
//!
//! The fleet membership, cohort archetypes, artifact definitions, and
//! release plan are data, not logic: the orchestrator walks whatever
//! manifest it is handed and the same reconciliation applies. The
//! evaluation-kit manifest below is the fixed set shipped with the tool.

use serde::{Deserialize, Serialize};

/// One device in the fleet. The identifier is the natural key for all
/// remote device operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub identifier: String,
    pub target: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One cohort archetype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortSpec {
    pub name: String,
    pub description: String,
}

/// One build target of an artifact version, with its payload size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub target: String,
    pub bytes: u64,
}

/// One artifact at a specific version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    pub description: String,
    pub version: String,
    pub targets: Vec<TargetSpec>,
}

/// A named bundle of artifact versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSpec {
    pub name: String,
    pub artifacts: Vec<ArtifactSpec>,
}

/// A release binding a bundle to a cohort with a phase policy. An empty
/// `phase_tags` list means a 100% rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub name: String,
    pub bundle: String,
    pub version: String,
    #[serde(default)]
    pub version_requirement: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub phase_tags: Vec<String>,
}

/// Everything one provisioning run operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub devices: Vec<DeviceSpec>,
    pub cohorts: Vec<CohortSpec>,
    pub bundles: Vec<BundleSpec>,
    pub releases: Vec<ReleaseSpec>,
}

impl Manifest {
    /// The evaluation-kit fleet: six devices, four cohort archetypes, two
    /// bundle generations, and the two-step release plan (full rollout,
    /// then a canary-scoped upgrade).
    #[must_use]
    pub fn evaluation_kit() -> Self {
        let device = |identifier: &str, tags: &[&str]| DeviceSpec {
            identifier: identifier.to_string(),
            target: "arm64-v8".to_string(),
            tags: tags.iter().map(ToString::to_string).collect(),
        };
        let cohort = |name: &str, description: &str| CohortSpec {
            name: name.to_string(),
            description: description.to_string(),
        };
        let artifact = |name: &str, description: &str, version: &str, targets: &[(&str, u64)]| {
            ArtifactSpec {
                name: name.to_string(),
                description: description.to_string(),
                version: version.to_string(),
                targets: targets
                    .iter()
                    .map(|(target, bytes)| TargetSpec {
                        target: (*target).to_string(),
                        bytes: *bytes,
                    })
                    .collect(),
            }
        };

        Self {
            devices: vec![
                device("EK-IOT-0001", &["canary"]),
                device("EK-IOT-0002", &["canary"]),
                device("EK-IOT-0003", &[]),
                device("EK-IOT-0004", &[]),
                device("EK-IOT-0005", &[]),
                device("EK-IOT-0006", &[]),
            ],
            cohorts: vec![
                cohort(
                    "release",
                    "Devices running stable, production-ready firmware releases \
                     suitable for end users or wider deployment.",
                ),
                cohort(
                    "release-debug",
                    "Devices running release candidate builds with debugging features \
                     enabled, for in-depth testing in a near-production environment.",
                ),
                cohort(
                    "daily-release",
                    "Devices running daily release builds, more stable than debug \
                     builds but updated frequently for testing and validation.",
                ),
                cohort(
                    "daily-debug",
                    "Devices running daily debug builds, typically used by developers \
                     for active development and testing.",
                ),
            ],
            bundles: vec![
                BundleSpec {
                    name: "r1001".to_string(),
                    artifacts: vec![
                        artifact(
                            "edge-sense-os",
                            "Edge Sense Product OS",
                            "v1.12.1",
                            &[("arm64-v8", 67_108_864), ("x86_64", 69_206_016)],
                        ),
                        artifact(
                            "edge-sense-agent",
                            "Edge Sense Telemetry Agent",
                            "v1.5.3",
                            &[("arm64-v8", 10_485_760), ("x86_64", 14_680_064)],
                        ),
                        artifact(
                            "edge-sense-peripheral",
                            "Edge Sense Peripheral Firmware",
                            "v1.9.10",
                            &[("arm-cortex-m33", 2_097_152)],
                        ),
                        artifact(
                            "edge-sense-model",
                            "Edge Sense ML Model",
                            "v1.4.0",
                            &[("arm-ethos-u65", 33_554_432)],
                        ),
                    ],
                },
                BundleSpec {
                    name: "r1002".to_string(),
                    artifacts: vec![
                        artifact(
                            "edge-sense-os",
                            "Edge Sense Product OS",
                            "v1.12.1",
                            &[("arm64-v8", 67_108_864), ("x86_64", 69_206_016)],
                        ),
                        artifact(
                            "edge-sense-agent",
                            "Edge Sense Telemetry Agent",
                            "v2.0.0",
                            &[("arm64-v8", 10_486_260), ("x86_64", 14_685_064)],
                        ),
                        artifact(
                            "edge-sense-peripheral",
                            "Edge Sense Peripheral Firmware",
                            "v1.9.10",
                            &[("arm-cortex-m33", 2_097_152)],
                        ),
                        artifact(
                            "edge-sense-model",
                            "Edge Sense ML Model",
                            "v2.1.0",
                            &[("arm-ethos-u65", 43_554_432)],
                        ),
                    ],
                },
            ],
            releases: vec![
                ReleaseSpec {
                    name: "release-r1001".to_string(),
                    bundle: "r1001".to_string(),
                    version: "1.1.0".to_string(),
                    version_requirement: String::new(),
                    disabled: false,
                    phase_tags: Vec::new(),
                },
                ReleaseSpec {
                    name: "release-r1002".to_string(),
                    bundle: "r1002".to_string(),
                    version: "2.0.0".to_string(),
                    version_requirement: "~> 1.1".to_string(),
                    disabled: true,
                    phase_tags: vec!["canary".to_string()],
                },
            ],
        }
    }

    /// Look up a bundle by name.
    #[must_use]
    pub fn bundle(&self, name: &str) -> Option<&BundleSpec> {
        self.bundles.iter().find(|b| b.name == name)
    }
}
