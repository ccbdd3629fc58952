//! Test-support helpers: a local ES256 token signer and the key-set
//! document an issuer would publish for it.
//!
//! Feature-gated behind `testutil` so none of this reaches production
//! builds. Integration tests enable it via the self dev-dependency.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use serde_json::json;

/// A locally generated P-256 signing key acting as the identity issuer.
pub struct TokenSigner {
    signing_key: SigningKey,
    pub kid: String,
}

impl TokenSigner {
    pub fn generate(kid: &str) -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
            kid: kid.to_string(),
        }
    }

    /// Public half as a JWK Set document, as the issuer would publish it.
    pub fn jwks(&self) -> serde_json::Value {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        json!({
            "keys": [{
                "kty": "EC",
                "crv": "P-256",
                "alg": "ES256",
                "use": "sig",
                "kid": self.kid,
                "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
                "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
            }]
        })
    }

    /// Mint a compact-serialized identity token over `claims`.
    pub fn mint(&self, claims: &serde_json::Value) -> String {
        let header = json!({"alg": "ES256", "typ": "JWT", "kid": self.kid});
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let sig: Signature = self.signing_key.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig.to_bytes()))
    }
}

/// Well-formed identity claims, an hour from expiry.
pub fn identity_claims(email: &str, sub: &str, client_id: &str) -> serde_json::Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "iss": "https://accounts.google.com",
        "sub": sub,
        "email": email,
        "email_verified": true,
        "aud": client_id,
        "azp": client_id,
        "iat": now,
        "exp": now + 3600,
    })
}
