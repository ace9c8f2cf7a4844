//! Port-forward lease lifecycle
//!
//! The provider grants a signed lease over a forwarded port. Leases are
//! renewed DHCP-style: well before expiry, once the remaining lifetime
//! drops below a fixed fraction of the total. A healthy lease costs no
//! network calls. The port number can change across renewals, so the
//! last delivered port is recorded separately from the lease and a
//! configured hook command is invoked whenever it changes.

use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ProviderApi, SignatureGrant};
use crate::error::Result;
use crate::retry::{retry, RetryPolicy};
use crate::state::{unix_now, StateDir, STATE_VERSION};

const LEASE_FILE: &str = "lease.json";
const PORT_FILE: &str = "port.json";

/// Provider-defined signature lifetime (two months)
pub const SIGNATURE_LIFE_SECONDS: u64 = 60 * 24 * 3600;

/// Renew once the remaining lifetime drops below this fraction of the
/// total. Provider-defined constants above and here are not published;
/// these values follow the provider's reference scripts.
const RENEW_THRESHOLD_SECONDS: u64 = SIGNATURE_LIFE_SECONDS / 4;

/// How long the port-change hook may run before it is killed
const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct LeaseFile {
    version: u32,
    grant: SignatureGrant,
}

#[derive(Serialize, Deserialize)]
struct PortFile {
    version: u32,
    port: u16,
    updated_at: u64,
}

/// Whether the lease must be renewed at `now`
fn needs_renewal(grant: &SignatureGrant, now: u64) -> bool {
    grant.expires_at.saturating_sub(now) < RENEW_THRESHOLD_SECONDS
}

/// Capability interface for the external port-change notification
pub trait PortNotifier {
    fn notify(&self, port: u16) -> std::result::Result<(), String>;
}

/// Runs the configured hook command with the port appended as the final
/// argument, under its own timeout independent of the retry policy.
pub struct HookCommand {
    command: String,
    timeout: Duration,
}

impl HookCommand {
    pub fn new(command: String) -> Self {
        Self {
            command,
            timeout: HOOK_TIMEOUT,
        }
    }
}

impl PortNotifier for HookCommand {
    fn notify(&self, port: u16) -> std::result::Result<(), String> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| "empty hook command".to_string())?;

        let mut child = Command::new(program)
            .args(parts)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to spawn {program}: {e}"))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => return Err(format!("hook exited with {status}")),
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("hook timed out after {:?}", self.timeout));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(format!("failed to wait for hook: {e}")),
            }
        }
    }
}

pub struct PortForwardManager<'a, A: ProviderApi, N: PortNotifier> {
    api: &'a A,
    state: &'a StateDir,
    retry: &'a RetryPolicy,
    notifier: Option<&'a N>,
}

impl<'a, A: ProviderApi, N: PortNotifier> PortForwardManager<'a, A, N> {
    pub fn new(
        api: &'a A,
        state: &'a StateDir,
        retry: &'a RetryPolicy,
        notifier: Option<&'a N>,
    ) -> Self {
        Self {
            api,
            state,
            retry,
            notifier,
        }
    }

    /// Ensure a valid forwarded-port lease exists, renewing it when it
    /// approaches expiry, and fire the hook when the port changed.
    pub fn ensure_forwarded_port(
        &self,
        host: &str,
        ip: Ipv4Addr,
        token: &str,
    ) -> Result<SignatureGrant> {
        let now = unix_now();
        let stored = self
            .state
            .load::<LeaseFile>(LEASE_FILE)
            .filter(|l| l.version == STATE_VERSION)
            .map(|l| l.grant);

        let grant = match stored {
            Some(grant) if !needs_renewal(&grant, now) => {
                debug!(
                    port = grant.port,
                    valid_for_secs = grant.expires_at - now,
                    "lease is healthy, no renewal needed"
                );
                grant
            }
            stored => {
                if stored.is_some() {
                    info!("lease expired or near expiry, renewing");
                } else {
                    info!("no lease on record, requesting one");
                }
                self.renew(host, ip, token)?
            }
        };

        self.record_port_change(grant.port);
        Ok(grant)
    }

    fn renew(&self, host: &str, ip: Ipv4Addr, token: &str) -> Result<SignatureGrant> {
        let grant = retry(self.retry, "fetch_signature", || {
            self.api.fetch_signature(host, ip, token)
        })
        .map_err(|e| e.into_last())?
        .into_inner();

        retry(self.retry, "bind_port", || {
            self.api.bind_port(host, ip, &grant)
        })
        .map_err(|e| e.into_last())?;

        self.state.store(
            LEASE_FILE,
            &LeaseFile {
                version: STATE_VERSION,
                grant: grant.clone(),
            },
        )?;
        info!(port = grant.port, "forwarded-port lease active");
        Ok(grant)
    }

    /// Fire the hook when the delivered port differs from the recorded
    /// one. The recorded port is updated after the hook returns either
    /// way; a failing hook is reported, not retried.
    fn record_port_change(&self, port: u16) {
        let previous = recorded_port(self.state);
        if previous == Some(port) {
            return;
        }

        info!(previous = ?previous, port, "forwarded port changed");
        if let Some(notifier) = self.notifier {
            match notifier.notify(port) {
                Ok(()) => info!(port, "port-change hook ran"),
                Err(reason) => warn!(port, reason, "port-change hook failed"),
            }
        }

        if let Err(e) = self.state.store(
            PORT_FILE,
            &PortFile {
                version: STATE_VERSION,
                port,
                updated_at: unix_now(),
            },
        ) {
            warn!(error = %e, "could not record forwarded port");
        }
    }
}

/// The last recorded forwarded port, if any
pub fn recorded_port(state: &StateDir) -> Option<u16> {
    state
        .load::<PortFile>(PORT_FILE)
        .filter(|p| p.version == STATE_VERSION)
        .map(|p| p.port)
}

/// The persisted lease, if any (read-only, used by status output)
pub fn stored_lease(state: &StateDir) -> Option<SignatureGrant> {
    state
        .load::<LeaseFile>(LEASE_FILE)
        .filter(|l| l.version == STATE_VERSION)
        .map(|l| l.grant)
}
