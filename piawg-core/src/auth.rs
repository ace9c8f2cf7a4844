//! Auth token acquisition and caching
//!
//! Tokens are valid for an hour. Each invocation reuses the cached token
//! when it belongs to the configured user and still has comfortable
//! lifetime left; only then is the credential exchange skipped entirely,
//! which is the idempotency guarantee for authentication.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::ProviderApi;
use crate::error::Result;
use crate::retry::{retry, RetryPolicy};
use crate::state::{unix_now, StateDir, STATE_VERSION};

const TOKEN_FILE: &str = "token.json";

/// Provider-defined token lifetime
pub const TOKEN_LIFE_SECONDS: u64 = 3600;

/// Renew once the token enters the final 10% of its lifetime
const RENEW_MARGIN_SECONDS: u64 = TOKEN_LIFE_SECONDS / 10;

#[derive(Serialize, Deserialize)]
struct TokenFile {
    version: u32,
    username: String,
    token: String,
    expires_at: u64,
}

impl TokenFile {
    fn usable_for(&self, username: &str, now: u64) -> bool {
        if self.version != STATE_VERSION {
            debug!("stored token has a stale format");
            false
        } else if self.username != username {
            debug!("stored token is for a different user");
            false
        } else if self.expires_at.saturating_sub(now) <= RENEW_MARGIN_SECONDS {
            debug!("stored token is expired or inside the renewal margin");
            false
        } else {
            debug!(
                valid_for_secs = self.expires_at - now,
                "valid stored token found"
            );
            true
        }
    }
}

pub struct AuthClient<'a, A: ProviderApi> {
    api: &'a A,
    state: &'a StateDir,
    retry: &'a RetryPolicy,
}

impl<'a, A: ProviderApi> AuthClient<'a, A> {
    pub fn new(api: &'a A, state: &'a StateDir, retry: &'a RetryPolicy) -> Self {
        Self { api, state, retry }
    }

    /// Return a valid auth token, from cache when possible.
    pub fn token(&self, username: &str, password: &SecretString) -> Result<String> {
        let now = unix_now();
        if let Some(stored) = self.state.load::<TokenFile>(TOKEN_FILE) {
            if stored.usable_for(username, now) {
                return Ok(stored.token);
            }
        }

        info!(username, "fetching a new auth token");
        let token = retry(self.retry, "generate_token", || {
            self.api.generate_token(username, password)
        })
        .map_err(|e| e.into_last())?
        .into_inner();

        self.state.store(
            TOKEN_FILE,
            &TokenFile {
                version: STATE_VERSION,
                username: username.to_string(),
                token: token.clone(),
                expires_at: now + TOKEN_LIFE_SECONDS,
            },
        )?;
        info!("auth token renewed");
        Ok(token)
    }
}
