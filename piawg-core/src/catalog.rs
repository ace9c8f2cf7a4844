//! Server catalog: region list retrieval, caching, and selection
//!
//! The provider's server-list document changes rarely, so it is cached
//! for twelve hours. Selection is deterministic: the first WireGuard
//! server of the configured region.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ProviderApi, Region, ServerEndpoint};
use crate::error::{ApiError, Result};
use crate::retry::{retry, RetryPolicy};
use crate::state::{unix_now, StateDir, STATE_VERSION};

const REGIONS_FILE: &str = "regions.json";

/// Provider-defined region cache lifetime
pub const REGION_LIFE_SECONDS: u64 = 43200;

#[derive(Serialize, Deserialize)]
struct RegionsFile {
    version: u32,
    expires_at: u64,
    regions: Vec<Region>,
}

pub struct Catalog<'a, A: ProviderApi> {
    api: &'a A,
    state: &'a StateDir,
    retry: &'a RetryPolicy,
}

impl<'a, A: ProviderApi> Catalog<'a, A> {
    pub fn new(api: &'a A, state: &'a StateDir, retry: &'a RetryPolicy) -> Self {
        Self { api, state, retry }
    }

    /// The current region list, served from cache while fresh
    pub fn regions(&self) -> Result<Vec<Region>> {
        let now = unix_now();
        if let Some(stored) = self.state.load::<RegionsFile>(REGIONS_FILE) {
            if stored.version == STATE_VERSION && stored.expires_at > now {
                debug!(
                    valid_for_secs = stored.expires_at - now,
                    "using cached region list"
                );
                return Ok(stored.regions);
            }
            debug!("cached region list is stale");
        }

        info!("fetching new region list");
        let regions = retry(self.retry, "fetch_regions", || self.api.fetch_regions())
            .map_err(|e| e.into_last())?
            .into_inner();

        // Listing mode may run unprivileged; a read-only state dir only
        // costs us the cache.
        if let Err(e) = self.state.store(
            REGIONS_FILE,
            &RegionsFile {
                version: STATE_VERSION,
                expires_at: now + REGION_LIFE_SECONDS,
                regions: regions.clone(),
            },
        ) {
            warn!(error = %e, "could not cache region list");
        }
        Ok(regions)
    }

    /// Deterministically select the server endpoint for a region
    pub fn select(&self, region_id: &str) -> Result<(ServerEndpoint, Region)> {
        let regions = self.regions()?;
        let region = regions
            .into_iter()
            .find(|r| r.id == region_id)
            .ok_or_else(|| ApiError::NoSuchRegion {
                region: region_id.to_string(),
            })?;
        let server = region.servers.first().ok_or_else(|| ApiError::NoSuchRegion {
            region: region_id.to_string(),
        })?;
        debug!(region = region_id, server = %server.cn, "selected server");
        Ok((
            ServerEndpoint {
                region: region.id.clone(),
                cn: server.cn.clone(),
                ip: server.ip,
            },
            region,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::WgServer;
    use secrecy::SecretString;
    use std::cell::Cell;
    use std::net::Ipv4Addr;

    struct FakeApi {
        fetches: Cell<u32>,
        regions: Vec<Region>,
    }

    impl FakeApi {
        fn with_regions(regions: Vec<Region>) -> Self {
            Self {
                fetches: Cell::new(0),
                regions,
            }
        }
    }

    impl ProviderApi for FakeApi {
        fn generate_token(&self, _: &str, _: &SecretString) -> std::result::Result<String, ApiError> {
            unreachable!("catalog never authenticates")
        }

        fn fetch_regions(&self) -> std::result::Result<Vec<Region>, ApiError> {
            self.fetches.set(self.fetches.get() + 1);
            Ok(self.regions.clone())
        }

        fn register_key(
            &self,
            _: &ServerEndpoint,
            _: &str,
            _: &str,
        ) -> std::result::Result<crate::api::Registration, ApiError> {
            unreachable!("catalog never registers keys")
        }

        fn fetch_signature(
            &self,
            _: &str,
            _: Ipv4Addr,
            _: &str,
        ) -> std::result::Result<crate::api::SignatureGrant, ApiError> {
            unreachable!()
        }

        fn bind_port(
            &self,
            _: &str,
            _: Ipv4Addr,
            _: &crate::api::SignatureGrant,
        ) -> std::result::Result<(), ApiError> {
            unreachable!()
        }
    }

    fn sample_regions() -> Vec<Region> {
        vec![
            Region {
                id: "ca_toronto".into(),
                name: "CA Toronto".into(),
                port_forward: true,
                servers: vec![
                    WgServer {
                        cn: "toronto401".into(),
                        ip: Ipv4Addr::new(10, 1, 1, 1),
                    },
                    WgServer {
                        cn: "toronto402".into(),
                        ip: Ipv4Addr::new(10, 1, 1, 2),
                    },
                ],
            },
            Region {
                id: "us_east".into(),
                name: "US East".into(),
                port_forward: false,
                servers: vec![WgServer {
                    cn: "newyork401".into(),
                    ip: Ipv4Addr::new(10, 2, 2, 2),
                }],
            },
        ]
    }

    #[test]
    fn selects_first_server_of_region() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let api = FakeApi::with_regions(sample_regions());
        let retry = RetryPolicy::with_max_attempts(1);
        let catalog = Catalog::new(&api, &state, &retry);

        let (server, region) = catalog.select("ca_toronto").unwrap();
        assert_eq!(server.cn, "toronto401");
        assert_eq!(server.ip, Ipv4Addr::new(10, 1, 1, 1));
        assert!(region.port_forward);
    }

    #[test]
    fn unknown_region_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let api = FakeApi::with_regions(sample_regions());
        let retry = RetryPolicy::with_max_attempts(1);
        let catalog = Catalog::new(&api, &state, &retry);

        let err = catalog.select("atlantis").unwrap_err();
        assert!(matches!(
            err,
            crate::error::PiawgError::Api(ApiError::NoSuchRegion { ref region }) if region == "atlantis"
        ));
    }

    #[test]
    fn cached_list_avoids_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let api = FakeApi::with_regions(sample_regions());
        let retry = RetryPolicy::with_max_attempts(1);
        let catalog = Catalog::new(&api, &state, &retry);

        catalog.regions().unwrap();
        catalog.regions().unwrap();
        assert_eq!(api.fetches.get(), 1);
    }

    #[test]
    fn stale_cache_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let api = FakeApi::with_regions(sample_regions());
        let retry = RetryPolicy::with_max_attempts(1);
        let catalog = Catalog::new(&api, &state, &retry);

        state
            .store(
                REGIONS_FILE,
                &RegionsFile {
                    version: STATE_VERSION,
                    expires_at: 0,
                    regions: sample_regions(),
                },
            )
            .unwrap();
        catalog.regions().unwrap();
        assert_eq!(api.fetches.get(), 1);
    }
}
