//! Identity-token verification against the issuer's published key set.
//!
//! Keys come from the issuer's OpenID discovery document and are cached
//! with a fetch timestamp. A failed signature verification forces exactly
//! one key-set refresh and retry, but only when the cache is older than
//! five minutes: legitimate key rotation is picked up quickly, while a
//! flood of bad tokens cannot turn the verify path into a cache-busting
//! oracle against the issuer.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::AuthError;

/// Minimum cache age before a signature failure may force a refresh.
pub const REFRESH_GATE: Duration = Duration::from_secs(300);

/// Claims carried by an identity token. `email`, `sub`, `aud` and `azp`
/// are all required; `azp` is the OAuth client the token was issued to
/// and is the claim checked against the configured client id.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    pub aud: String,
    pub azp: String,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

/// Output of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    pub subject_id: String,
    pub email: String,
    pub email_verified: bool,
    pub audience: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

struct CachedKeys {
    jwks: JwkSet,
    fetched_at: DateTime<Utc>,
}

/// Shared key-set cache: an explicit value + timestamp pair behind a lock.
///
/// Concurrent refreshes are allowed and last-write-wins; the key set is
/// eventually consistent.
#[derive(Default)]
pub struct JwksCache {
    inner: Mutex<Option<CachedKeys>>,
}

impl JwksCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Option<(JwkSet, DateTime<Utc>)> {
        self.inner
            .lock()
            .as_ref()
            .map(|c| (c.jwks.clone(), c.fetched_at))
    }

    /// Replace the cached key set, stamped now.
    pub fn store(&self, jwks: JwkSet) {
        self.store_at(jwks, Utc::now());
    }

    /// Replace the cached key set with an explicit fetch timestamp.
    pub fn store_at(&self, jwks: JwkSet, fetched_at: DateTime<Utc>) {
        *self.inner.lock() = Some(CachedKeys { jwks, fetched_at });
    }
}

/// Verifies raw compact identity tokens.
pub struct Verifier {
    discovery_url: String,
    expected_client_id: String,
    timeout: Duration,
    cache: Arc<JwksCache>,
    http: reqwest::Client,
}

impl Verifier {
    pub fn new(
        discovery_url: String,
        expected_client_id: String,
        timeout: Duration,
        cache: Arc<JwksCache>,
    ) -> Self {
        Self {
            discovery_url,
            expected_client_id,
            timeout,
            cache,
            http: reqwest::Client::new(),
        }
    }

    /// Verify a raw compact token and return its claims.
    ///
    /// Malformed input and audience mismatches fail with no retry. A
    /// signature that does not verify (or an unknown key id) triggers the
    /// single gated refresh described in the module docs. Unreachable
    /// issuer endpoints always fail closed.
    pub async fn verify(&self, raw: &str) -> Result<VerifiedClaims, AuthError> {
        let raw = raw.trim();
        if raw.split('.').count() != 3 {
            return Err(AuthError::MalformedToken);
        }
        let header = decode_header(raw).map_err(|_| AuthError::MalformedToken)?;
        // Probe the payload before touching the network: bad encoding or
        // bad JSON is rejected outright, with no fetch and no retry.
        decode_claims_unverified(raw)?;

        let (jwks, fetched_at) = match self.cache.snapshot() {
            Some(cached) => cached,
            None => (self.fetch_keys().await?, Utc::now()),
        };

        let claims = match check_signature(raw, &header, &jwks) {
            Ok(claims) => claims,
            Err(AuthError::SignatureInvalid) => {
                let age = Utc::now().signed_duration_since(fetched_at);
                if age.num_seconds() <= REFRESH_GATE.as_secs() as i64 {
                    return Err(AuthError::SignatureInvalid);
                }
                // One forced refresh, one retry. A second failure is final.
                let jwks = self.fetch_keys().await?;
                check_signature(raw, &header, &jwks)?
            }
            Err(e) => return Err(e),
        };

        if claims.azp != self.expected_client_id {
            return Err(AuthError::AudienceMismatch);
        }

        Ok(VerifiedClaims {
            subject_id: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified,
            audience: claims.aud,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    /// Fetch the discovery document, then the key set it points at, and
    /// overwrite the shared cache. Single attempt, hard timeout.
    async fn fetch_keys(&self) -> Result<JwkSet, AuthError> {
        let discovery: serde_json::Value = self
            .http
            .get(&self.discovery_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(format!("discovery fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::Upstream(format!("discovery parse failed: {e}")))?;
        let jwks_uri = discovery["jwks_uri"]
            .as_str()
            .ok_or_else(|| AuthError::Upstream("no jwks_uri in discovery document".into()))?;

        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(format!("key-set fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::Upstream(format!("key-set parse failed: {e}")))?;

        self.cache.store(jwks.clone());
        Ok(jwks)
    }
}

/// Parse the claims segment without verifying the signature. Used to
/// classify malformed input before any network traffic.
fn decode_claims_unverified(raw: &str) -> Result<IdentityClaims, AuthError> {
    let payload = raw.split('.').nth(1).ok_or(AuthError::MalformedToken)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::MalformedToken)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::MalformedToken)
}

/// Verify the token against one key set.
fn check_signature(
    raw: &str,
    header: &jsonwebtoken::Header,
    jwks: &JwkSet,
) -> Result<IdentityClaims, AuthError> {
    if !matches!(header.alg, Algorithm::RS256 | Algorithm::ES256) {
        return Err(AuthError::MalformedToken);
    }
    let kid = header.kid.as_deref().ok_or(AuthError::MalformedToken)?;
    // An unknown kid takes the same path as a bad signature: rotation
    // publishes new key ids, and the forced refresh picks them up.
    let jwk = jwks.find(kid).ok_or(AuthError::SignatureInvalid)?;
    let key = DecodingKey::from_jwk(jwk).map_err(|_| AuthError::SignatureInvalid)?;

    let mut validation = Validation::new(header.alg);
    // The audience is checked against configuration by the caller; the
    // token's aud is the client id, not this service.
    validation.validate_aud = false;

    let data = decode::<IdentityClaims>(raw, &key, &validation).map_err(classify)?;
    Ok(data.claims)
}

fn classify(e: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::MalformedToken,
        _ => AuthError::SignatureInvalid,
    }
}
