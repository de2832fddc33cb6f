//! `fleetkit register-devices` - device environments, certificates, and
//! remote registration.

use anyhow::{Context, Result};
use fleetkit_core::manifest::Manifest;
use fleetkit_core::paths::DataPaths;
use fleetkit_core::provision;

use super::active_client;

/// Materialize every device's local environment and register the fleet
/// under the given product and cohort.
pub fn run(product_name: &str, cohort_name: &str) -> Result<()> {
    let paths = DataPaths::resolve();
    let (_, client) = active_client(&paths)?;
    let manifest = Manifest::evaluation_kit();

    provision::register_devices(&client, &paths, &manifest, product_name, cohort_name)
        .with_context(|| {
            format!("failed to register devices in '{product_name}'/'{cohort_name}'")
        })?;

    println!(
        "Registered {} devices in cohort '{cohort_name}'.",
        manifest.devices.len()
    );
    Ok(())
}
