//! Runtime requirement checks
//!
//! Reconciling mutates network interfaces, so the process must run as
//! root (or with CAP_NET_ADMIN via a capability-aware init) and the
//! WireGuard userland must be installed. Checked up front so a
//! misconfigured deployment fails before any network traffic.

use nix::unistd::Uid;
use tracing::debug;

use crate::error::RequirementError;

const REQUIRED_TOOLS: [&str; 2] = ["wg-quick", "wg"];

/// Verify all runtime requirements for a reconciliation run
pub fn check_all() -> Result<(), RequirementError> {
    if !Uid::effective().is_root() {
        return Err(RequirementError::NotRoot);
    }
    debug!("running as root");

    for tool in REQUIRED_TOOLS {
        which::which(tool).map_err(|_| RequirementError::MissingTool {
            tool: tool.to_string(),
        })?;
        debug!(tool, "required tool is present");
    }
    Ok(())
}
