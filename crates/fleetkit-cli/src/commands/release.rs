//! `fleetkit publish-release` - artifacts, binaries, bundles, releases.

use anyhow::{Context, Result};
use fleetkit_core::manifest::Manifest;
use fleetkit_core::paths::DataPaths;
use fleetkit_core::provision;

use super::active_client;

/// Publish the manifest's bundles and releases to the given cohort.
pub fn run(product_name: &str, cohort_name: &str) -> Result<()> {
    let paths = DataPaths::resolve();
    let (_, client) = active_client(&paths)?;
    let manifest = Manifest::evaluation_kit();

    provision::publish_release(&client, &paths, &manifest, product_name, cohort_name)
        .with_context(|| {
            format!("failed to publish releases to '{product_name}'/'{cohort_name}'")
        })?;

    println!(
        "Published {} releases to cohort '{cohort_name}'.",
        manifest.releases.len()
    );
    Ok(())
}
