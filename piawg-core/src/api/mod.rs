//! Provider API surface
//!
//! The Private Internet Access HTTP protocol is fixed: a token exchange,
//! a server-list document, per-server key registration, and the
//! port-forward signature/bind pair. The reconciler consumes it through
//! the [`ProviderApi`] capability trait so every component above the wire
//! can be exercised with fakes; [`http::PiaHttpClient`] is the production
//! implementation.

pub mod http;

use std::net::Ipv4Addr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// One wg-capable server within a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgServer {
    pub cn: String,
    pub ip: Ipv4Addr,
}

/// A provider region offering WireGuard servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub port_forward: bool,
    pub servers: Vec<WgServer>,
}

/// The server endpoint selected for this invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub region: String,
    pub cn: String,
    pub ip: Ipv4Addr,
}

/// Result of registering our public key with a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Internal address assigned to our peer
    pub peer_address: String,
    /// First DNS server pushed by the provider
    pub dns: Ipv4Addr,
    /// Server-side WireGuard public key (base64)
    pub server_key: String,
    /// Endpoint the tunnel connects to
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
}

/// A signed port-forward grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureGrant {
    pub port: u16,
    /// Opaque signature over the payload, echoed back on bind
    pub signature: String,
    /// Base64 payload carrying the port and expiry
    pub payload: String,
    /// Grant expiry as unix seconds
    pub expires_at: u64,
}

/// Everything the reconciler needs from the provider
pub trait ProviderApi {
    /// Exchange account credentials for a bearer token
    fn generate_token(&self, username: &str, password: &SecretString) -> Result<String, ApiError>;

    /// Fetch the current server-list document, filtered to wg regions
    fn fetch_regions(&self) -> Result<Vec<Region>, ApiError>;

    /// Register a WireGuard public key with the selected server
    fn register_key(
        &self,
        server: &ServerEndpoint,
        token: &str,
        public_key: &str,
    ) -> Result<Registration, ApiError>;

    /// Obtain a signed port-forward grant from the connected server
    fn fetch_signature(
        &self,
        host: &str,
        ip: Ipv4Addr,
        token: &str,
    ) -> Result<SignatureGrant, ApiError>;

    /// Activate a grant on the connected server
    fn bind_port(&self, host: &str, ip: Ipv4Addr, grant: &SignatureGrant) -> Result<(), ApiError>;
}
