//! Command implementations, one module per top-level subcommand.

use anyhow::{Context, Result};
use fleetkit_core::config::{ActiveProfile, ToolConfig, read_document};
use fleetkit_core::paths::DataPaths;

use crate::client::vendor::VendorCli;

pub mod configure;
pub mod devices;
pub mod product;
pub mod release;

/// Resolve the configured profile and a vendor CLI client bound to it.
/// Every command except `configure` starts here.
fn active_client(paths: &DataPaths) -> Result<(ActiveProfile, VendorCli)> {
    let tool_config: ToolConfig = read_document(&paths.tool_config_file())
        .context("failed to read tool configuration")?;
    let active = tool_config.require_profile()?;
    let client = VendorCli::new(&active.profile);
    Ok((active, client))
}
