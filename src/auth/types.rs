// Authentication types

use serde::{Deserialize, Serialize};

/// Store key holding the access token
pub const TOKEN_KEY: &str = "TOKEN";

/// Store key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "REFRESH_TOKEN";

/// Application-level status code the API uses for a successful token exchange
pub const STATUS_CODE_OK: u16 = 200;

/// Access/refresh token pair as persisted in the credential store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Refresh endpoint request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Login endpoint request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Envelope returned by the login and refresh endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEnvelope {
    pub status_code: u16,
    pub message: Option<String>,
    pub data: Option<TokenData>,
}

/// Token data inside a successful envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<TokenData> for CredentialPair {
    fn from(data: TokenData) -> Self {
        Self {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        }
    }
}

/// Shortened token for log output
pub fn token_preview(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(token.len());
    &token[..end]
}
