use std::time::Duration;

use aliri_base64::Base64Url;
use aliri_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef};

/// An access token along with the claims decoded from it
///
/// The expiration date is taken from the token's own `exp` claim. A token
/// without an `exp` claim expires at the beginning of the Unix epoch, and
/// so is always considered expired.
///
/// The claims are decoded, but the token's signature is _not_ verified. The
/// token is trusted because it was issued by the identity provider or read
/// back from token storage.
#[derive(Clone, Debug)]
pub struct TokenData {
    token: AccessToken,
    claims: TokenClaims,
    expiration: UnixTime,
}

/// Claims carried by an access token
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<u64>,
    #[serde(flatten)]
    additional: serde_json::Map<String, serde_json::Value>,
}

impl TokenClaims {
    /// The `iss` claim
    pub fn issuer(&self) -> Option<&str> {
        self.iss.as_deref()
    }

    /// The `sub` claim
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// The `exp` claim
    pub fn expiration(&self) -> Option<UnixTime> {
        self.exp.map(UnixTime)
    }

    /// The `nbf` claim
    pub fn not_before(&self) -> Option<UnixTime> {
        self.nbf.map(UnixTime)
    }

    /// The `iat` claim
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.iat.map(UnixTime)
    }

    /// Any other claim present in the token
    pub fn get(&self, claim: &str) -> Option<&serde_json::Value> {
        self.additional.get(claim)
    }
}

/// An error decoding an access token
#[derive(Debug, Error)]
pub enum TokenDataError {
    /// The token is not a well-formed JWT
    #[error("access token is not a well-formed JWT")]
    Malformed,
    /// The token payload is not valid base64url
    #[error("access token payload is not valid base64url")]
    PayloadEncoding(#[from] aliri_base64::InvalidBase64Data),
    /// The token payload does not contain a JSON claims object
    #[error("access token payload does not contain valid claims")]
    Claims(#[from] serde_json::Error),
}

impl TokenData {
    /// Decodes an access token
    pub fn new(token: impl Into<AccessToken>) -> Result<Self, TokenDataError> {
        let token = token.into();
        let claims = decode_claims(&token)?;
        let expiration = claims.expiration().unwrap_or_default();

        Ok(Self {
            token,
            claims,
            expiration,
        })
    }

    /// The encoded access token
    #[inline]
    pub fn token(&self) -> &AccessTokenRef {
        &self.token
    }

    /// The decoded claims
    #[inline]
    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// The time after which the token is no longer valid
    #[inline]
    pub fn expiration_date(&self) -> UnixTime {
        self.expiration
    }

    /// Whether the token has expired, according to the system clock
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_with_clock(&System)
    }

    /// Whether the token has expired, according to the provided clock
    #[inline]
    pub fn is_expired_with_clock<C: Clock>(&self, clock: &C) -> bool {
        self.is_expired_at(clock.now())
    }

    /// Whether the token would be expired as of the provided time
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        time > self.expiration
    }

    /// How much longer the token would be valid as of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> Duration {
        Duration::from_secs(self.expiration.0.saturating_sub(time.0))
    }
}

/// Decodes the payload segment without looking at the header, so tokens using
/// any `alg`, including `none`, are accepted.
fn decode_claims(token: &AccessTokenRef) -> Result<TokenClaims, TokenDataError> {
    let mut segments = token.as_str().split('.');
    let (Some(header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenDataError::Malformed);
    };
    if header.is_empty() || payload.is_empty() {
        return Err(TokenDataError::Malformed);
    }

    let payload = Base64Url::from_encoded(payload)?;
    Ok(serde_json::from_slice(payload.as_slice())?)
}
