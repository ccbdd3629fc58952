//! Failure taxonomy for the decision paths.
//!
//! Every variant maps to a stable reason code that REST handlers surface
//! in the structured response body. Transport status is always 200; the
//! taxonomy exists so callers (and tests) can branch on body fields.

use thiserror::Error;

/// Identity-token verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong segment count, bad base64url, or bad JSON. Never retried.
    #[error("malformed identity token")]
    MalformedToken,

    /// Signature did not verify against any published key, or the key id
    /// is unknown. Eligible for the single forced key-set refresh.
    #[error("token signature invalid")]
    SignatureInvalid,

    /// Token audience/client-id does not match configuration. Never retried.
    #[error("token audience mismatch")]
    AudienceMismatch,

    /// Token expiry is in the past.
    #[error("token expired")]
    Expired,

    /// Issuer discovery or key-set endpoint unreachable or malformed.
    /// Always fails closed.
    #[error("issuer unavailable: {0}")]
    Upstream(String),
}

impl AuthError {
    /// Stable reason code surfaced in verdict bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MalformedToken => "MALFORMED_TOKEN",
            AuthError::SignatureInvalid => "SIGNATURE_INVALID",
            AuthError::AudienceMismatch => "AUDIENCE_MISMATCH",
            AuthError::Expired => "TOKEN_EXPIRED",
            AuthError::Upstream(_) => "ISSUER_UNAVAILABLE",
        }
    }
}

/// Membership-oracle failures. An unreachable oracle is never a grant.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership oracle unavailable: {0}")]
    Unavailable(String),
}

/// Identity-registry failures, surfaced verbatim as not-granted reasons.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Registration attempted without the scoped override held.
    #[error("reader registration is closed")]
    RegistrationClosed,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::RegistrationClosed => "REGISTRATION_CLOSED",
            RegistryError::Db(_) => "REGISTRY_ERROR",
        }
    }
}
