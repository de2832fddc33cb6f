//! fleetkit-core - provisioning engine for an IoT evaluation-kit fleet.
//!
//! The crate converges a desired hierarchy of remote resources
//! (organization, product, cohorts, CA chain, signing keys, devices,
//! certificates, artifacts, bundles, releases) against a control plane that
//! only offers create-or-already-exists semantics, and prepares the binary
//! boot-configuration block each device's bootloader consumes.
//!
//! Modules, leaves first:
//!
//! - [`envblock`]: binary boot-environment codec (CRC-32C header,
//!   NUL-delimited records)
//! - [`pki`]: root / intermediate / end-entity trust hierarchy and Ed25519
//!   signing key pairs
//! - [`reconcile`]: the create-else-lookup idempotency primitive over the
//!   control-plane client
//! - [`config`]: whole-document JSON configuration store
//! - [`manifest`]: declarative fleet / cohort / artifact / release data
//! - [`provision`]: the four end-to-end flows sequencing all of the above
//!
//! Everything is synchronous: each flow is a bounded, terminating batch job
//! with one control-plane call in flight at a time.

pub mod config;
pub mod envblock;
pub mod manifest;
pub mod paths;
pub mod pki;
pub mod provision;
pub mod reconcile;
