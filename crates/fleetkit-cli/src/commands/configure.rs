//! `fleetkit configure` - profile and credential setup.

use anyhow::{Context, Result};
use fleetkit_core::paths::DataPaths;
use fleetkit_core::provision;

use crate::client::vendor::VendorCli;

/// Write the profile documents, ensure the root CA, and verify the control
/// plane answers with the given API key.
pub fn run(organization_name: &str, organization_prn: &str, api_key: &str) -> Result<()> {
    let paths = DataPaths::resolve();
    let client = VendorCli::new(organization_name);

    provision::configure(
        &client,
        &paths,
        organization_name,
        organization_prn,
        api_key,
    )
    .context("configuration failed")?;

    println!("Profile '{organization_name}' configured.");
    println!("Configuration directory: {}", paths.root().display());
    Ok(())
}
