//! One-time metering-unlock ledger, held by the client as a cookie.
//!
//! A grant is a deterministic keyed hash of the (resource, subject) pair;
//! the server stores nothing. Integrity rests on the unguessability of
//! the HMAC output: without the server secret a client cannot construct
//! the cookie name for a pair it was never granted. There is no revoke;
//! grants disappear only through cookie expiry or manual clearing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Grant cookies live for about a year.
pub const GRANT_COOKIE_MAX_AGE_SECS: i64 = 31_556_926;

/// Value stored in a grant cookie. The name carries all the information.
pub const GRANT_COOKIE_VALUE: &str = "true";

/// Computes and recognizes unlock grants.
pub struct Ledger {
    secret: Vec<u8>,
    cookie_prefix: String,
}

impl Ledger {
    pub fn new(secret: Vec<u8>, cookie_prefix: String) -> Self {
        Self {
            secret,
            cookie_prefix,
        }
    }

    /// Deterministic, collision-resistant key for a (resource, subject)
    /// pair: hex(HMAC-SHA256(secret, resource "." subject)).
    pub fn grant_key(&self, resource_id: &str, subject_id: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(resource_id.as_bytes());
        mac.update(b".");
        mac.update(subject_id.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Cookie name carrying the grant for a pair.
    pub fn cookie_name(&self, resource_id: &str, subject_id: i64) -> String {
        format!("{}{}", self.cookie_prefix, self.grant_key(resource_id, subject_id))
    }

    /// Issue (or re-issue) the grant for a pair. Idempotent: the key is
    /// deterministic, so repeated issuance yields the same credential.
    /// Returns (grant key, Set-Cookie header value).
    pub fn issue(&self, resource_id: &str, subject_id: i64) -> (String, String) {
        let key = self.grant_key(resource_id, subject_id);
        let cookie = format!(
            "{}{}={}; Max-Age={}; Path=/; SameSite=Lax",
            self.cookie_prefix, key, GRANT_COOKIE_VALUE, GRANT_COOKIE_MAX_AGE_SECS
        );
        (key, cookie)
    }

    /// Whether the client-held cookies carry the grant for a pair.
    pub fn is_present(
        &self,
        resource_id: &str,
        subject_id: i64,
        cookies: &std::collections::HashMap<String, String>,
    ) -> bool {
        cookies.contains_key(&self.cookie_name(resource_id, subject_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ledger() -> Ledger {
        Ledger::new(b"test-secret".to_vec(), "presspass_".to_string())
    }

    #[test]
    fn grant_key_is_deterministic_and_pair_unique() {
        let l = ledger();
        assert_eq!(l.grant_key("post-7", 42), l.grant_key("post-7", 42));
        assert_ne!(l.grant_key("post-7", 42), l.grant_key("post-8", 42));
        assert_ne!(l.grant_key("post-7", 42), l.grant_key("post-7", 43));
        // Concatenation is delimited: (ab, c) and (a, bc) must differ.
        assert_ne!(l.grant_key("post-71", 2), l.grant_key("post-7", 12));
    }

    #[test]
    fn key_depends_on_secret() {
        let a = Ledger::new(b"secret-a".to_vec(), "presspass_".to_string());
        let b = Ledger::new(b"secret-b".to_vec(), "presspass_".to_string());
        assert_ne!(a.grant_key("post-7", 42), b.grant_key("post-7", 42));
    }

    #[test]
    fn issue_then_present() {
        let l = ledger();
        let (key, cookie) = l.issue("post-7", 42);
        assert!(cookie.starts_with(&format!("presspass_{key}=true;")));
        assert!(cookie.contains("Max-Age=31556926"));

        let mut cookies = HashMap::new();
        assert!(!l.is_present("post-7", 42, &cookies));
        cookies.insert(format!("presspass_{key}"), "true".to_string());
        assert!(l.is_present("post-7", 42, &cookies));
        assert!(!l.is_present("post-9", 42, &cookies));
    }

    #[test]
    fn reissue_yields_same_credential() {
        let l = ledger();
        assert_eq!(l.issue("post-7", 42), l.issue("post-7", 42));
    }
}
