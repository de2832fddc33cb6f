//! `fleetkit create-product` - product, cohorts, CA chain, signing keys.

use anyhow::{Context, Result};
use fleetkit_core::manifest::Manifest;
use fleetkit_core::paths::DataPaths;
use fleetkit_core::provision;

use super::active_client;

/// Converge the product and its per-cohort trust and signing material.
pub fn run(product_name: &str) -> Result<()> {
    let paths = DataPaths::resolve();
    let (_, client) = active_client(&paths)?;
    let manifest = Manifest::evaluation_kit();

    provision::create_product(&client, &paths, &manifest, product_name)
        .with_context(|| format!("failed to create product '{product_name}'"))?;

    println!(
        "Product '{product_name}' ready: {} cohorts with intermediate CAs and signing keys.",
        manifest.cohorts.len()
    );
    Ok(())
}
