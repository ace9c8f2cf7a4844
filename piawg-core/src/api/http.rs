//! Blocking HTTP implementation of [`ProviderApi`]
//!
//! The provider's per-server endpoints (`addKey`, `getSignature`,
//! `bindPort`) present certificates issued by PIA's own CA for the
//! server's common name, while DNS for those names does not exist. Each
//! call therefore builds a client that trusts the downloaded provider CA
//! and pins the common name to the server's IP address.

use std::net::Ipv4Addr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::Certificate;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::api::{ProviderApi, Region, Registration, ServerEndpoint, SignatureGrant, WgServer};
use crate::error::ApiError;
use crate::state::StateDir;

const TOKEN_ADDRESS: &str = "https://www.privateinternetaccess.com/gtoken/generateToken";
const REGION_ADDRESS: &str = "https://serverlist.piaservers.net/vpninfo/servers/v6";
const SSL_CERT_ADDRESS: &str =
    "https://raw.githubusercontent.com/pia-foss/manual-connections/master/ca.rsa.4096.crt";

/// On-disk name of the cached provider CA
const CA_FILE: &str = "ca.rsa.4096.crt";

/// Port of the per-server key registration endpoint
const REGISTER_PORT: u16 = 1337;
/// Port of the per-server port-forward endpoints
const PORT_FORWARD_PORT: u16 = 19999;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A server-list body shorter than this is a truncated download
const MIN_REGION_BODY_LEN: usize = 1000;

pub struct PiaHttpClient {
    state: StateDir,
    client: Client,
}

impl PiaHttpClient {
    pub fn new(state: StateDir) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self { state, client })
    }

    /// Load the provider CA from the state dir, downloading it once
    fn provider_ca(&self) -> Result<Certificate, ApiError> {
        let pem = match std::fs::read(self.state.path(CA_FILE)) {
            Ok(pem) => pem,
            Err(_) => {
                info!("downloading provider CA certificate");
                let body = self
                    .client
                    .get(SSL_CERT_ADDRESS)
                    .send()
                    .map_err(transport)?
                    .error_for_status()
                    .map_err(transport)?
                    .bytes()
                    .map_err(transport)?;
                self.state
                    .store_raw(CA_FILE, &body)
                    .map_err(|e| ApiError::Transport {
                        message: format!("failed to cache provider CA: {e}"),
                    })?;
                body.to_vec()
            }
        };
        Certificate::from_pem(&pem).map_err(|e| ApiError::MalformedResponse {
            message: format!("provider CA is not valid PEM: {e}"),
        })
    }

    /// Client that trusts the provider CA and resolves `cn` to `ip`
    fn pinned_client(&self, cn: &str, ip: Ipv4Addr) -> Result<Client, ApiError> {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .add_root_certificate(self.provider_ca()?)
            .resolve(cn, (std::net::IpAddr::V4(ip), 0).into())
            .build()
            .map_err(transport)
    }
}

fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport {
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    status: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RegionsDocument {
    regions: Vec<RawRegion>,
}

#[derive(Deserialize)]
struct RawRegion {
    id: String,
    name: String,
    port_forward: bool,
    servers: RawServers,
}

#[derive(Deserialize)]
struct RawServers {
    #[serde(default)]
    wg: Vec<WgServer>,
}

#[derive(Deserialize)]
struct AddKeyResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    peer_ip: String,
    #[serde(default)]
    dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    server_key: String,
    #[serde(default)]
    server_ip: Option<Ipv4Addr>,
    #[serde(default, deserialize_with = "port_from_number_or_string")]
    server_port: Option<u16>,
}

#[derive(Deserialize)]
struct SignatureResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    signature: String,
    #[serde(default)]
    payload: String,
}

/// Decoded contents of the signature payload
#[derive(Deserialize)]
struct SignaturePayload {
    port: u16,
    expires_at: String,
}

#[derive(Deserialize)]
struct BindResponse {
    status: String,
    #[serde(default)]
    message: String,
}

/// The provider is inconsistent about numeric fields: `server_port` has
/// been observed both as a number and as a string.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u16),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .parse::<u16>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port value: {s:?}"))),
    }
}

impl ProviderApi for PiaHttpClient {
    fn generate_token(&self, username: &str, password: &SecretString) -> Result<String, ApiError> {
        debug!(username, "requesting auth token");
        let resp: TokenResponse = self
            .client
            .get(TOKEN_ADDRESS)
            .basic_auth(username, Some(password.expose_secret()))
            .send()
            .map_err(transport)?
            .json()
            .map_err(|e| ApiError::MalformedResponse {
                message: format!("token response: {e}"),
            })?;

        if resp.status != "OK" {
            return Err(ApiError::AuthenticationFailed {
                message: resp.message,
            });
        }
        if resp.token.is_empty() {
            return Err(ApiError::MalformedResponse {
                message: "token response carried no token".to_string(),
            });
        }
        Ok(resp.token)
    }

    fn fetch_regions(&self) -> Result<Vec<Region>, ApiError> {
        debug!("fetching region list");
        let resp = self
            .client
            .get(REGION_ADDRESS)
            .send()
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        let body = resp.text().map_err(transport)?;

        if body.len() < MIN_REGION_BODY_LEN {
            return Err(ApiError::MalformedResponse {
                message: format!("server list suspiciously short ({} bytes)", body.len()),
            });
        }

        // The document is the first line; the remainder is a signature
        // over it that we do not verify.
        let json_line = body.lines().next().unwrap_or_default();
        let document: RegionsDocument =
            serde_json::from_str(json_line).map_err(|e| ApiError::MalformedResponse {
                message: format!("server list: {e}"),
            })?;

        Ok(document
            .regions
            .into_iter()
            .filter(|r| !r.servers.wg.is_empty())
            .map(|r| Region {
                id: r.id,
                name: r.name,
                port_forward: r.port_forward,
                servers: r.servers.wg,
            })
            .collect())
    }

    fn register_key(
        &self,
        server: &ServerEndpoint,
        token: &str,
        public_key: &str,
    ) -> Result<Registration, ApiError> {
        debug!(server = %server.cn, "registering public key");
        let client = self.pinned_client(&server.cn, server.ip)?;
        let resp: AddKeyResponse = client
            .get(format!("https://{}:{}/addKey", server.cn, REGISTER_PORT))
            .query(&[("pt", token), ("pubkey", public_key)])
            .send()
            .map_err(transport)?
            .json()
            .map_err(|e| ApiError::MalformedResponse {
                message: format!("addKey response: {e}"),
            })?;

        if resp.status != "OK" {
            return Err(ApiError::Registration {
                message: resp.message,
            });
        }

        let malformed = |field: &str| ApiError::MalformedResponse {
            message: format!("addKey response missing {field}"),
        };
        let registration = Registration {
            peer_address: match resp.peer_ip.is_empty() {
                true => return Err(malformed("peer_ip")),
                false => resp.peer_ip,
            },
            dns: resp
                .dns_servers
                .first()
                .copied()
                .ok_or_else(|| malformed("dns_servers"))?,
            server_key: match resp.server_key.is_empty() {
                true => return Err(malformed("server_key")),
                false => resp.server_key,
            },
            server_ip: resp.server_ip.ok_or_else(|| malformed("server_ip"))?,
            server_port: resp.server_port.ok_or_else(|| malformed("server_port"))?,
        };
        info!(server = %server.cn, "public key registered");
        Ok(registration)
    }

    fn fetch_signature(
        &self,
        host: &str,
        ip: Ipv4Addr,
        token: &str,
    ) -> Result<SignatureGrant, ApiError> {
        debug!(host, "requesting port-forward signature");
        let client = self.pinned_client(host, ip)?;
        let resp: SignatureResponse = client
            .get(format!("https://{host}:{PORT_FORWARD_PORT}/getSignature"))
            .query(&[("token", token)])
            .send()
            .map_err(transport)?
            .json()
            .map_err(|e| ApiError::MalformedResponse {
                message: format!("getSignature response: {e}"),
            })?;

        if resp.status != "OK" {
            return Err(ApiError::PortForwardRejected {
                message: resp.message,
            });
        }

        let decoded = BASE64
            .decode(&resp.payload)
            .map_err(|_| ApiError::MalformedResponse {
                message: "signature payload is not valid base64".to_string(),
            })?;
        let payload: SignaturePayload =
            serde_json::from_slice(&decoded).map_err(|e| ApiError::MalformedResponse {
                message: format!("signature payload: {e}"),
            })?;
        let expires_at = parse_expiry(&payload.expires_at)?;

        Ok(SignatureGrant {
            port: payload.port,
            signature: resp.signature,
            payload: resp.payload,
            expires_at,
        })
    }

    fn bind_port(&self, host: &str, ip: Ipv4Addr, grant: &SignatureGrant) -> Result<(), ApiError> {
        debug!(host, port = grant.port, "binding forwarded port");
        let client = self.pinned_client(host, ip)?;
        let resp: BindResponse = client
            .get(format!("https://{host}:{PORT_FORWARD_PORT}/bindPort"))
            .query(&[
                ("payload", grant.payload.as_str()),
                ("signature", grant.signature.as_str()),
            ])
            .send()
            .map_err(transport)?
            .json()
            .map_err(|e| ApiError::MalformedResponse {
                message: format!("bindPort response: {e}"),
            })?;

        if resp.status != "OK" {
            return Err(ApiError::PortForwardRejected {
                message: resp.message,
            });
        }
        Ok(())
    }
}

/// Provider expiry strings are RFC 3339 with over-long fractional
/// seconds, which chrono accepts.
fn parse_expiry(raw: &str) -> Result<u64, ApiError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp().max(0) as u64)
        .map_err(|e| ApiError::MalformedResponse {
            message: format!("invalid expires_at {raw:?}: {e}"),
        })
}
