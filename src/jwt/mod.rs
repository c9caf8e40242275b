//! Unverified JWT claim inspection.
//!
//! The client never validates token signatures; it only needs to look
//! inside tokens it already holds to decide scope and expiry. Claims are
//! decoded straight from the payload segment of a compact JWS.

use crate::errors::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Decoded claims of a signed or unsigned token blob.
#[derive(Debug, Clone)]
pub struct Claims {
    claims: Map<String, Value>,
}

impl Claims {
    /// Wraps an existing claims map.
    pub fn new(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    /// Decodes the claims from a compact JWT/JWS without verifying the
    /// signature.
    pub fn from_raw_token(token: &str) -> Result<Self> {
        let mut parts = token.split('.');
        let payload = match (parts.next(), parts.next()) {
            (Some(_), Some(payload)) => payload,
            _ => return Err(Error::InvalidToken("not a compact JWT".to_string())),
        };

        let decoded = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| Error::InvalidToken(format!("payload is not base64: {}", e)))?;

        let claims: Map<String, Value> = serde_json::from_slice(&decoded)
            .map_err(|e| Error::InvalidToken(format!("claims are not a JSON object: {}", e)))?;

        Ok(Self::new(claims))
    }

    /// Returns a string claim by name.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.claims.get(key).and_then(Value::as_str)
    }

    /// Returns the token scopes from the `scopes` claim, if present.
    pub fn get_scopes(&self) -> Option<Vec<String>> {
        let values = self.claims.get("scopes")?.as_array()?;

        Some(
            values
                .iter()
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .collect(),
        )
    }

    /// Returns the expiry of the token from the `exp` claim.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        let exp = self.claims.get("exp")?.as_f64()?;
        let secs = exp.trunc() as i64;
        let nanos = (exp.fract() * 1e9) as u32;

        DateTime::from_timestamp(secs, nanos)
    }

    /// Indicates whether the token has expired. A token with no `exp`
    /// claim never expires.
    pub fn has_expired(&self) -> bool {
        match self.expiry() {
            Some(expiry) => expiry < Utc::now(),
            None => false,
        }
    }

    /// Returns the subject (`sub`) claim.
    pub fn get_subject(&self) -> Option<&str> {
        self.get_string("sub")
    }

    /// Returns the issuer (`iss`) claim.
    pub fn get_issuer(&self) -> Option<&str> {
        self.get_string("iss")
    }

    /// Returns the underlying claims map.
    pub fn raw_claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}
