// Token refresh exchange

use serde_json::Value;

use super::types::{CredentialPair, RefreshRequest, TokenEnvelope, STATUS_CODE_OK};
use crate::error::RefreshError;
use crate::models::Method;
use crate::transport::{OutgoingRequest, Transport};

/// Exchange a refresh token for a new credential pair
///
/// A 2xx response whose envelope carries a `statusCode` other than 200 is a
/// failure, the same as a transport error.
pub async fn refresh_tokens(
    transport: &dyn Transport,
    refresh_path: &str,
    refresh_token: &str,
) -> Result<CredentialPair, RefreshError> {
    tracing::info!("Refreshing access token...");

    let body = serde_json::to_value(RefreshRequest {
        refresh_token: refresh_token.to_string(),
    })
    .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

    let mut request = OutgoingRequest::new(Method::Post, refresh_path);
    request.data = Some(body);
    request
        .headers
        .push(("Accept".to_string(), "application/json".to_string()));

    let response = transport
        .send(request)
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !response.is_success() {
        tracing::error!(
            status = response.status,
            body = %response.body,
            "Token refresh failed"
        );
        return Err(RefreshError::Http {
            status: response.status,
            body: response.body,
        });
    }

    let pair = parse_token_envelope(response.body)?;
    tracing::info!("Access token refreshed");
    Ok(pair)
}

/// Parse the `{statusCode, message?, data: {accessToken, refreshToken}}`
/// envelope shared by the login and refresh endpoints
pub fn parse_token_envelope(body: Value) -> Result<CredentialPair, RefreshError> {
    let envelope: TokenEnvelope = serde_json::from_value(body)
        .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

    if envelope.status_code != STATUS_CODE_OK {
        return Err(RefreshError::Rejected {
            status_code: envelope.status_code,
            message: envelope.message.unwrap_or_default(),
        });
    }

    let data = envelope
        .data
        .ok_or_else(|| RefreshError::InvalidResponse("response does not contain data".to_string()))?;

    if data.access_token.is_empty() {
        return Err(RefreshError::InvalidResponse(
            "response does not contain accessToken".to_string(),
        ));
    }

    Ok(data.into())
}
