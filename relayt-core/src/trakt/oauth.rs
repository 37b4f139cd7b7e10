use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /oauth/token`, covering both grant types.
#[derive(Debug, Serialize)]
pub(crate) struct TokenRequest<'a> {
    pub grant_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<&'a str>,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub redirect_uri: &'a str,
}

impl<'a> TokenRequest<'a> {
    pub fn authorization_code(
        code: &'a str,
        client_id: &'a str,
        client_secret: &'a str,
        redirect_uri: &'a str,
    ) -> Self {
        Self {
            grant_type: "authorization_code",
            code: Some(code),
            refresh_token: None,
            client_id,
            client_secret,
            redirect_uri,
        }
    }

    pub fn refresh(
        refresh_token: &'a str,
        client_id: &'a str,
        client_secret: &'a str,
        redirect_uri: &'a str,
    ) -> Self {
        Self {
            grant_type: "refresh_token",
            code: None,
            refresh_token: Some(refresh_token),
            client_id,
            client_secret,
            redirect_uri,
        }
    }
}

/// A token pair handed back by the OAuth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds of validity from `created_at`.
    pub expires_in: i64,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl TokenGrant {
    /// Absolute expiry of the access token.
    pub fn expiry(&self) -> DateTime<Utc> {
        let issued = self
            .created_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);
        issued + chrono::Duration::seconds(self.expires_in)
    }
}
