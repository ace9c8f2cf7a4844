//! wg-quick backed implementation of [`TunnelControl`]
//!
//! The interface is managed through the system's `wg-quick` with a
//! rendered configuration artifact under `/etc/wireguard`. Liveness is
//! probed through `/sys/class/net`; the live peer snapshot is recovered
//! from the artifact we rendered when the interface was brought up.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::registrar::TunnelPeerConfig;
use crate::state::write_restricted;
use crate::tunnel::{PeerSnapshot, TunnelControl};

/// Name of the managed WireGuard interface
pub const INTERFACE: &str = "pia";

const WIREGUARD_DIR: &str = "/etc/wireguard";
const SYS_NET_DIR: &str = "/sys/class/net";

const PERSISTENT_KEEPALIVE: u16 = 25;
const ALLOWED_IPS: &str = "0.0.0.0/0";

pub struct WgQuick {
    config_dir: PathBuf,
    sys_net_dir: PathBuf,
}

impl Default for WgQuick {
    fn default() -> Self {
        Self::new()
    }
}

impl WgQuick {
    pub fn new() -> Self {
        Self {
            config_dir: PathBuf::from(WIREGUARD_DIR),
            sys_net_dir: PathBuf::from(SYS_NET_DIR),
        }
    }

    /// Probe and parse against alternate directories (tests)
    pub fn with_dirs<P: Into<PathBuf>, Q: Into<PathBuf>>(config_dir: P, sys_net_dir: Q) -> Self {
        Self {
            config_dir: config_dir.into(),
            sys_net_dir: sys_net_dir.into(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{INTERFACE}.conf"))
    }

    fn interface_present(&self) -> bool {
        self.sys_net_dir.join(INTERFACE).exists()
    }

    /// Live peer counters from `wg show`, `None` when the interface is
    /// absent or reports no peer
    pub fn stats(&self) -> Result<Option<LinkStats>, TunnelError> {
        if !self.interface_present() {
            return Ok(None);
        }
        let output = Command::new("wg")
            .args(["show", INTERFACE, "dump"])
            .output()
            .map_err(|e| TunnelError::CommandSpawn {
                reason: format!("wg show: {e}"),
            })?;
        if !output.status.success() {
            debug!(status = %output.status, "wg show failed");
            return Ok(None);
        }
        Ok(parse_stats(&String::from_utf8_lossy(&output.stdout)))
    }

    fn run_wg_quick(&self, action: &str) -> Result<(), TunnelError> {
        let output = Command::new("wg-quick")
            .arg(action)
            .arg(INTERFACE)
            .output()
            .map_err(|e| TunnelError::CommandSpawn {
                reason: format!("wg-quick {action}: {e}"),
            })?;

        if output.status.success() {
            debug!(action, "wg-quick succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = format!("wg-quick {action} exited with {}: {stderr}", output.status);
            match action {
                "up" => Err(TunnelError::ActivationFailed { reason }),
                _ => Err(TunnelError::TeardownFailed { reason }),
            }
        }
    }
}

/// Peer counters reported by the WireGuard userland
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStats {
    pub endpoint: String,
    /// Unix seconds of the latest handshake, 0 when none has happened
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Parse `wg show <interface> dump` output. The first line describes the
/// interface; each following line is one peer as tab-separated fields
/// (public key, preshared key, endpoint, allowed IPs, latest handshake,
/// rx, tx, keepalive).
pub fn parse_stats(dump: &str) -> Option<LinkStats> {
    let peer = dump.lines().nth(1)?;
    let fields: Vec<&str> = peer.split('\t').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(LinkStats {
        endpoint: fields[2].to_string(),
        latest_handshake: fields[4].parse().ok()?,
        rx_bytes: fields[5].parse().ok()?,
        tx_bytes: fields[6].parse().ok()?,
    })
}

/// Render the wg-quick configuration artifact for the desired config
pub fn render(desired: &TunnelPeerConfig) -> String {
    format!(
        "[Interface]\n\
         Address = {address}\n\
         PrivateKey = {private_key}\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PersistentKeepalive = {keepalive}\n\
         PublicKey = {public_key}\n\
         AllowedIPs = {allowed_ips}\n\
         Endpoint = {endpoint}\n\
         # Hostname = {hostname}\n",
        address = desired.address,
        private_key = desired.private_key.to_base64(),
        dns = desired.dns,
        keepalive = PERSISTENT_KEEPALIVE,
        public_key = desired.peer_public_key,
        allowed_ips = ALLOWED_IPS,
        endpoint = desired.endpoint,
        hostname = desired.hostname,
    )
}

/// Recover the peer snapshot from a rendered configuration artifact
pub fn parse_snapshot(contents: &str) -> PeerSnapshot {
    let mut snapshot = PeerSnapshot::default();
    let mut section = "";

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            section = line;
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match (section, key) {
            ("[Interface]", "Address") => snapshot.address = value.to_string(),
            ("[Peer]", "PublicKey") => snapshot.public_key = value.to_string(),
            ("[Peer]", "Endpoint") => snapshot.endpoint = value.to_string(),
            _ => {}
        }
    }
    snapshot
}

impl TunnelControl for WgQuick {
    fn current(&self) -> Result<Option<PeerSnapshot>, TunnelError> {
        if !self.interface_present() {
            debug!(interface = INTERFACE, "interface is absent");
            return Ok(None);
        }
        match std::fs::read_to_string(self.config_path()) {
            Ok(contents) => Ok(Some(parse_snapshot(&contents))),
            Err(e) => {
                // An interface without its artifact cannot be verified;
                // an empty snapshot never matches, forcing reconfiguration.
                warn!(error = %e, "interface is up but its config artifact is unreadable");
                Ok(Some(PeerSnapshot::default()))
            }
        }
    }

    fn activate(&self, desired: &TunnelPeerConfig) -> Result<(), TunnelError> {
        write_restricted(&self.config_path(), &render(desired)).map_err(|e| {
            TunnelError::ConfigArtifact {
                reason: format!("writing {}: {e}", self.config_path().display()),
            }
        })?;
        self.run_wg_quick("up")
    }

    fn deactivate(&self) -> Result<(), TunnelError> {
        self.run_wg_quick("down")?;
        if let Err(e) = std::fs::remove_file(self.config_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(TunnelError::ConfigArtifact {
                    reason: format!("removing {}: {e}", self.config_path().display()),
                });
            }
        }
        Ok(())
    }
}
