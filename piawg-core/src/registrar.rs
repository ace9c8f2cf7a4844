//! Peer-key registration
//!
//! Registers the local WireGuard public key with the selected server and
//! turns the response into the desired tunnel configuration. Registering
//! the same key against the same server with a valid token is idempotent
//! on the provider side: it yields the same address assignment.

use std::net::Ipv4Addr;

use tracing::info;

use crate::api::{ProviderApi, ServerEndpoint};
use crate::error::Result;
use crate::keys::{KeyPair, PrivateKey};
use crate::retry::{retry, RetryPolicy};
use crate::state::StateDir;

/// The desired tunnel configuration, fully computed before any
/// interface mutation is attempted.
#[derive(Debug, Clone)]
pub struct TunnelPeerConfig {
    pub private_key: PrivateKey,
    /// Internal address assigned to this peer
    pub address: String,
    pub dns: Ipv4Addr,
    /// Server-side public key (base64)
    pub peer_public_key: String,
    /// Peer endpoint as `ip:port`
    pub endpoint: String,
    /// Server hostname, kept for certificate-name pinning on the
    /// port-forward endpoints
    pub hostname: String,
    /// The endpoint's bare IP, used for pinned resolution
    pub endpoint_ip: Ipv4Addr,
}

pub struct KeyRegistrar<'a, A: ProviderApi> {
    api: &'a A,
    state: &'a StateDir,
    retry: &'a RetryPolicy,
}

impl<'a, A: ProviderApi> KeyRegistrar<'a, A> {
    pub fn new(api: &'a A, state: &'a StateDir, retry: &'a RetryPolicy) -> Self {
        Self { api, state, retry }
    }

    /// Load or generate the local keypair and register it with `server`.
    pub fn register_peer(&self, token: &str, server: &ServerEndpoint) -> Result<TunnelPeerConfig> {
        let keypair = KeyPair::load_or_generate(self.state)?;
        let public_key = keypair.public.to_base64();

        let registration = retry(self.retry, "register_key", || {
            self.api.register_key(server, token, &public_key)
        })
        .map_err(|e| e.into_last())?
        .into_inner();

        info!(server = %server.cn, peer_key = %registration.server_key, "peer registered");
        Ok(TunnelPeerConfig {
            private_key: keypair.private,
            address: registration.peer_address,
            dns: registration.dns,
            peer_public_key: registration.server_key,
            endpoint: format!("{}:{}", registration.server_ip, registration.server_port),
            hostname: server.cn.clone(),
            endpoint_ip: registration.server_ip,
        })
    }
}
