use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use relayt_config::TraktConfig;
use relayt_model::{ScrobbleAction, ScrobbleBody};

use super::oauth::{TokenGrant, TokenRequest};
use super::types::{
    OAuthErrorBody, ScrobbleOutcome, TraktError, UserSettings,
};
use super::ScrobbleApi;
use crate::error::{BridgeError, Result};

const API_VERSION: &str = "2";

/// HTTP client for the watch-tracking API.
#[derive(Debug, Clone)]
pub struct TraktClient {
    http: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl TraktClient {
    pub fn new(config: &TraktConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                BridgeError::Internal(format!(
                    "Failed to build HTTP client: {e}"
                ))
            })?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn api_headers(
        &self,
        request: reqwest::RequestBuilder,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        request
            .bearer_auth(access_token)
            .header("trakt-api-version", API_VERSION)
            .header("trakt-api-key", &self.client_id)
    }

    async fn token_request(
        &self,
        body: TokenRequest<'_>,
    ) -> std::result::Result<TokenGrant, TraktError> {
        let response = self
            .http
            .post(self.url("/oauth/token"))
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TokenGrant>()
                .await
                .map_err(|e| TraktError::Decode(e.to_string()));
        }

        match response.json::<OAuthErrorBody>().await {
            Ok(body) => {
                warn!(
                    error = %body.error,
                    "OAuth endpoint rejected the grant"
                );
                Err(TraktError::OAuth {
                    error: body.error,
                    description: body.error_description,
                })
            }
            Err(_) => Err(TraktError::Status {
                code: status.as_u16(),
            }),
        }
    }
}

fn map_transport(e: reqwest::Error) -> TraktError {
    if e.is_timeout() {
        TraktError::Network("timeout".to_string())
    } else {
        TraktError::Network(e.to_string())
    }
}

#[async_trait]
impl ScrobbleApi for TraktClient {
    async fn scrobble(
        &self,
        action: ScrobbleAction,
        body: &ScrobbleBody,
        access_token: &str,
    ) -> std::result::Result<ScrobbleOutcome, TraktError> {
        let url = self.url(&format!("/scrobble/{}", action.as_str()));
        debug!(%action, progress = body.progress, "Dispatching scrobble");

        let response = self
            .api_headers(self.http.post(&url), access_token)
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::CREATED => Ok(ScrobbleOutcome {
                status: status.as_u16(),
            }),
            _ => Err(TraktError::Status {
                code: status.as_u16(),
            }),
        }
    }

    async fn user_settings(
        &self,
        access_token: &str,
    ) -> std::result::Result<UserSettings, TraktError> {
        let response = self
            .api_headers(
                self.http.get(self.url("/users/settings")),
                access_token,
            )
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return response
                .json::<UserSettings>()
                .await
                .map_err(|e| TraktError::Decode(e.to_string()));
        }
        Err(TraktError::Status {
            code: status.as_u16(),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
    ) -> std::result::Result<TokenGrant, TraktError> {
        self.token_request(TokenRequest::authorization_code(
            code,
            &self.client_id,
            &self.client_secret,
            &self.redirect_uri,
        ))
        .await
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, TraktError> {
        self.token_request(TokenRequest::refresh(
            refresh_token,
            &self.client_id,
            &self.client_secret,
            &self.redirect_uri,
        ))
        .await
    }
}
