//! HTTP implementation of [`ConnectivityProbe`]
//!
//! With `AllowedIPs = 0.0.0.0/0` every packet egresses through the
//! tunnel, so fetching the public IP from a plain-text echo service and
//! comparing it to the tunnel endpoint proves the tunnel actually
//! carries traffic.

use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use crate::error::TunnelError;
use crate::tunnel::ConnectivityProbe;

const IP_CHECK_ADDRESS: &str = "https://api.ipify.org";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct IpCheck {
    client: Client,
}

impl IpCheck {
    pub fn new() -> Result<Self, TunnelError> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| TunnelError::ProbeFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl ConnectivityProbe for IpCheck {
    fn public_ip(&self) -> Result<Ipv4Addr, TunnelError> {
        let failed = |e: reqwest::Error| TunnelError::ProbeFailed {
            reason: e.to_string(),
        };
        let body = self
            .client
            .get(IP_CHECK_ADDRESS)
            .send()
            .map_err(failed)?
            .error_for_status()
            .map_err(failed)?
            .text()
            .map_err(failed)?;
        let ip = parse_public_ip(&body)?;
        debug!(%ip, "public IP fetched");
        Ok(ip)
    }
}

fn parse_public_ip(body: &str) -> Result<Ipv4Addr, TunnelError> {
    body.trim()
        .parse()
        .map_err(|_| TunnelError::ProbeFailed {
            reason: format!("unparseable public IP response {:?}", body.trim()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_address_parses() {
        assert_eq!(
            parse_public_ip("203.0.113.7").unwrap(),
            Ipv4Addr::new(203, 0, 113, 7)
        );
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        assert_eq!(
            parse_public_ip("  203.0.113.7\n").unwrap(),
            Ipv4Addr::new(203, 0, 113, 7)
        );
    }

    #[test]
    fn html_error_page_is_rejected() {
        assert!(parse_public_ip("<html>blocked</html>").is_err());
    }
}
