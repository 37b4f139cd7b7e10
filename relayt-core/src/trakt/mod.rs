//! Authenticated client for the watch-tracking API.
//!
//! Every request carries the API-key headers from the service contract; the
//! scrobble and settings calls additionally carry the member's bearer token.
//! [`ScrobbleApi`] is the seam the broadcaster, retry engine, and drainer
//! depend on, so tests can substitute the upstream wholesale.

mod client;
mod oauth;
mod types;

pub use client::TraktClient;
pub use oauth::TokenGrant;
pub use types::{ScrobbleOutcome, TraktError, UserSettings};

use async_trait::async_trait;
use relayt_model::{ScrobbleAction, ScrobbleBody};

/// The upstream operations the core dispatches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScrobbleApi: Send + Sync {
    /// `POST /scrobble/{start|pause|stop}` under the given bearer token.
    async fn scrobble(
        &self,
        action: ScrobbleAction,
        body: &ScrobbleBody,
        access_token: &str,
    ) -> Result<ScrobbleOutcome, TraktError>;

    /// `GET /users/settings`: health probe and display-name lookup.
    async fn user_settings(
        &self,
        access_token: &str,
    ) -> Result<UserSettings, TraktError>;

    /// Exchange an authorization code for a token pair.
    async fn exchange_code(&self, code: &str)
    -> Result<TokenGrant, TraktError>;

    /// Trade a refresh token for a fresh pair.
    async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenGrant, TraktError>;
}
