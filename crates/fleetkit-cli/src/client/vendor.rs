//! Vendor CLI subprocess client.
//!
//! All remote operations go through the vendor's `fleethub` CLI rather than
//! its HTTP API directly: the CLI owns authentication, retries, and upload
//! handling, and its profile mechanism shares the same config directory this
//! tool writes. Each invocation is one short-lived subprocess.

use std::process::Command;

use fleetkit_core::reconcile::{CliResponse, ControlPlane, ControlPlaneError};
use tracing::{debug, trace};

/// Name of the vendor CLI executable on the PATH.
pub const VENDOR_CLI: &str = "fleethub";

/// [`ControlPlane`] implementation spawning the vendor CLI, authenticated
/// through a named profile.
#[derive(Debug, Clone)]
pub struct VendorCli {
    program: String,
    profile: String,
}

impl VendorCli {
    /// Client for the given profile, using the `fleethub` executable from
    /// the PATH.
    #[must_use]
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            program: VENDOR_CLI.to_string(),
            profile: profile.into(),
        }
    }

    /// Override the executable (tests, wrapper scripts).
    #[must_use]
    pub fn with_program(program: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            profile: profile.into(),
        }
    }
}

impl ControlPlane for VendorCli {
    fn invoke(&self, args: &[String]) -> Result<CliResponse, ControlPlaneError> {
        debug!(program = %self.program, profile = %self.profile, ?args, "invoking vendor CLI");

        let output = Command::new(&self.program)
            .arg("--profile")
            .arg(&self.profile)
            .args(args)
            .output()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ControlPlaneError::ToolUnavailable {
                        program: self.program.clone(),
                    }
                } else {
                    ControlPlaneError::Io(source)
                }
            })?;

        let response = CliResponse {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            success = response.success,
            stdout = %response.stdout,
            stderr = %response.stderr,
            "vendor CLI response"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_maps_to_tool_unavailable() {
        let client = VendorCli::with_program("fleethub-does-not-exist", "acme");
        let err = client.invoke(&["users".to_string(), "me".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            ControlPlaneError::ToolUnavailable { ref program } if program == "fleethub-does-not-exist"
        ));
    }

    #[cfg(unix)]
    #[test]
    fn profile_flag_precedes_the_verb() {
        // `echo` reflects the argument vector back on stdout.
        let client = VendorCli::with_program("echo", "acme");
        let response = client
            .invoke(&["users".to_string(), "me".to_string()])
            .unwrap();
        assert!(response.success);
        assert_eq!(response.stdout.trim(), "--profile acme users me");
    }
}
