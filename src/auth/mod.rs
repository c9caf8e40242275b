//! Token classification helpers and the issued-token wire type.

use crate::errors::Result;
use crate::jwt::Claims;
use serde::{Deserialize, Serialize};

/// Scope carried by a token which may be exchanged for an access token.
pub const SCOPE_EXCHANGE: &str = "wayfinder:auth:exchange";
/// Scope carried by a classic refresh token.
pub const SCOPE_REFRESH: &str = "wayfinder:auth:refresh";
/// Scope carried by a workspace or platform access token.
pub const SCOPE_ACCESS_TOKEN: &str = "wayfinder:system:accesstoken";

/// Token issued by the `/login/token` and `/exchange` endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The newly minted access token.
    #[serde(default)]
    pub token: String,
    /// The refresh token, when one accompanies the access token.
    #[serde(rename = "refreshToken", default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
}

/// Checks the token for expiration. An empty token counts as expired.
pub fn is_token_expired(token: &str) -> Result<bool> {
    if token.is_empty() {
        return Ok(true);
    }

    let claims = Claims::from_raw_token(token)?;

    Ok(claims.has_expired())
}

/// Checks if the token is scoped for token exchange.
pub fn is_exchange_token(token: &str) -> Result<bool> {
    let claims = Claims::from_raw_token(token)?;

    Ok(is_exchange_scoped(&claims))
}

/// Checks if the token is an access token.
pub fn is_access_token(token: &str) -> Result<bool> {
    let claims = Claims::from_raw_token(token)?;

    Ok(is_access_token_scoped(&claims))
}

/// Checks if the claims carry the exchange scope.
pub fn is_exchange_scoped(claims: &Claims) -> bool {
    claims
        .get_scopes()
        .map(|scopes| scopes.iter().any(|s| s == SCOPE_EXCHANGE))
        .unwrap_or(false)
}

/// Checks if the claims carry the access-token scope.
pub fn is_access_token_scoped(claims: &Claims) -> bool {
    claims
        .get_scopes()
        .map(|scopes| scopes.iter().any(|s| s == SCOPE_ACCESS_TOKEN))
        .unwrap_or(false)
}
