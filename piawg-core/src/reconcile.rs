//! Per-invocation reconciliation sequence
//!
//! One invocation runs the whole chain: credentials → token → server →
//! registration → tunnel reconciliation → port forwarding. Everything up
//! to and including tunnel activation is fatal on failure; port
//! forwarding degrades to a warning because connectivity does not depend
//! on it.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::ProviderApi;
use crate::auth::AuthClient;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::Result;
use crate::forward::{PortForwardManager, PortNotifier};
use crate::registrar::KeyRegistrar;
use crate::retry::RetryPolicy;
use crate::state::{unix_now, StateDir, STATE_VERSION};
use crate::tunnel::{
    ConnectivityProbe, ReconcileAction, Reconciler, TunnelControl, TunnelState,
};

const RUN_FILE: &str = "run.json";

#[derive(Serialize, Deserialize)]
struct RunFile {
    version: u32,
    last_success: u64,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub action: ReconcileAction,
    pub state: TunnelState,
    pub forwarded_port: Option<u16>,
}

/// Run the full reconciliation sequence once.
pub fn reconcile<A, C, N>(
    config: &Config,
    state: &StateDir,
    api: &A,
    control: &C,
    probe: Option<&dyn ConnectivityProbe>,
    notifier: Option<&N>,
    retry: &RetryPolicy,
) -> Result<ReconciliationResult>
where
    A: ProviderApi,
    C: TunnelControl,
    N: PortNotifier,
{
    let token = AuthClient::new(api, state, retry).token(&config.username, &config.password)?;

    let (server, region) = Catalog::new(api, state, retry).select(&config.region)?;

    let desired = KeyRegistrar::new(api, state, retry).register_peer(&token, &server)?;

    let mut reconciler = Reconciler::new(control, retry);
    if let Some(probe) = probe {
        reconciler = reconciler.with_probe(probe);
    }
    let (action, tunnel_state) = reconciler.reconcile(&desired)?;

    let forwarded_port = if config.port_forward {
        if !region.port_forward {
            warn!(region = %region.id, "region does not support port forwarding");
            None
        } else {
            let manager = PortForwardManager::new(api, state, retry, notifier);
            match manager.ensure_forwarded_port(&desired.hostname, desired.endpoint_ip, &token) {
                Ok(grant) => Some(grant.port),
                // Non-fatal: the tunnel stays up without the port
                Err(e) => {
                    warn!(error = %e, "port forwarding unavailable this run");
                    None
                }
            }
        }
    } else {
        None
    };

    if let Err(e) = state.store(
        RUN_FILE,
        &RunFile {
            version: STATE_VERSION,
            last_success: unix_now(),
        },
    ) {
        warn!(error = %e, "could not record run timestamp");
    }

    info!(action = %action, state = %tunnel_state, port = ?forwarded_port, "reconciliation complete");
    Ok(ReconciliationResult {
        action,
        state: tunnel_state,
        forwarded_port,
    })
}

/// Unix timestamp of the last successful reconciliation, if any
pub fn last_success(state: &StateDir) -> Option<u64> {
    state
        .load::<RunFile>(RUN_FILE)
        .filter(|r| r.version == STATE_VERSION)
        .map(|r| r.last_success)
}
