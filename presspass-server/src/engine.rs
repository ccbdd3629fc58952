//! Entitlement decision engine.
//!
//! Composes the token verifier, identity registry, membership oracle and
//! unlock ledger into a verdict for each of the three request types:
//! token exchange, grant issuance, and status query. Verdicts are always
//! recomputed from current state, never persisted.
//!
//! Precedence is uniform: subscription access dominates metering, and an
//! issued metering grant is never downgraded here. For a non-subscriber
//! the only "not granted" state this engine can produce is the absence of
//! a grant.

use std::collections::HashMap;
use std::sync::Arc;

use crate::db::SubjectRow;
use crate::error::{AuthError, MembershipError, RegistryError};
use crate::ledger::Ledger;
use crate::membership::MembershipOracle;
use crate::registry::Registry;
use crate::verifier::Verifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReason {
    Subscriber,
    Metering,
}

impl GrantReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantReason::Subscriber => "SUBSCRIBER",
            GrantReason::Metering => "METERING",
        }
    }
}

/// The engine's access decision for one (subject, resource) pair.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub granted: bool,
    pub grant_reason: Option<GrantReason>,
    /// Reason code for a refusal that is not a plain metering miss.
    pub deny_code: Option<&'static str>,
    pub subject: Option<SubjectRow>,
}

impl Verdict {
    fn denied(code: &'static str) -> Self {
        Self {
            granted: false,
            grant_reason: None,
            deny_code: Some(code),
            subject: None,
        }
    }
}

/// A hard failure on a decision path. Always surfaced as not-granted with
/// a stable reason code; never an open gate.
#[derive(Debug)]
pub struct Denial {
    pub code: String,
}

impl From<AuthError> for Denial {
    fn from(e: AuthError) -> Self {
        Self {
            code: e.code().to_string(),
        }
    }
}

impl From<RegistryError> for Denial {
    fn from(e: RegistryError) -> Self {
        Self {
            code: e.code().to_string(),
        }
    }
}

impl From<MembershipError> for Denial {
    fn from(_: MembershipError) -> Self {
        Self {
            code: "MEMBERSHIP_UNAVAILABLE".to_string(),
        }
    }
}

/// Result of a token exchange: the verdict plus a fresh site session for
/// the now-logged-in subject.
#[derive(Debug)]
pub struct ExchangeOutcome {
    pub verdict: Verdict,
    pub session_token: Option<String>,
}

/// Result of an explicit grant-issuance call.
#[derive(Debug, Clone, PartialEq)]
pub enum GrantStatus {
    /// Subscription already covers the resource; no issuance needed.
    Subscriber,
    /// Grant issued (or re-issued, issuance is idempotent).
    Unlocked { grant_key: String, set_cookie: String },
    /// No resolvable subject or no resource named.
    NoUserOrPost,
}

pub struct Engine {
    pub verifier: Verifier,
    pub registry: Registry,
    pub ledger: Ledger,
    oracle: Arc<dyn MembershipOracle>,
}

impl Engine {
    pub fn new(
        verifier: Verifier,
        registry: Registry,
        ledger: Ledger,
        oracle: Arc<dyn MembershipOracle>,
    ) -> Self {
        Self {
            verifier,
            registry,
            ledger,
            oracle,
        }
    }

    /// Operation A: identity token in, verdict out. Logs the subject in
    /// (creating the record on first sight of the email) as a side effect.
    pub async fn exchange(
        &self,
        raw_token: &str,
        resource_id: &str,
        cookies: &HashMap<String, String>,
    ) -> Result<ExchangeOutcome, Denial> {
        let claims = self.verifier.verify(raw_token).await?;

        let subject = match self.registry.find_by_email(&claims.email)? {
            Some(existing) => {
                if existing.is_elevated() {
                    // Administrators and editors never receive reader
                    // entitlements through this path, and are not logged
                    // in by it either.
                    tracing::warn!(
                        email = %existing.email,
                        role = %existing.role,
                        "refused exchange for elevated account"
                    );
                    return Ok(ExchangeOutcome {
                        verdict: Verdict::denied("ELEVATED_ROLE"),
                        session_token: None,
                    });
                }
                existing
            }
            None => {
                let _bypass = self.registry.allow_registration();
                self.registry.register_reader(&claims.email)?
            }
        };

        self.registry
            .bind_external_sub(subject.id, &claims.subject_id)?;
        let subject = self
            .registry
            .find_by_email(&subject.email)?
            .ok_or_else(|| Denial {
                code: "REGISTRY_ERROR".to_string(),
            })?;
        let session_token = self.registry.set_current_session(subject.id)?;

        let verdict = self.decide(&subject, resource_id, cookies, true).await?;
        Ok(ExchangeOutcome {
            verdict,
            session_token: Some(session_token),
        })
    }

    /// Operation B: explicit unlock. The caller resolved the subject (by
    /// session or email); a missing subject or resource is reported, not
    /// an error.
    pub async fn issue_grant(
        &self,
        subject: Option<SubjectRow>,
        resource_id: Option<&str>,
    ) -> Result<GrantStatus, Denial> {
        let (subject, resource_id) = match (subject, resource_id) {
            (Some(s), Some(r)) => (s, r),
            _ => return Ok(GrantStatus::NoUserOrPost),
        };

        if self.oracle.can_view(subject.id, resource_id).await? {
            return Ok(GrantStatus::Subscriber);
        }

        let (grant_key, set_cookie) = self.ledger.issue(resource_id, subject.id);
        tracing::info!(
            subject_id = subject.id,
            resource_id,
            "issued metering unlock"
        );
        Ok(GrantStatus::Unlocked {
            grant_key,
            set_cookie,
        })
    }

    /// Operation C: session-authenticated status query. Idempotent;
    /// re-derives the verdict from current ledger + membership state.
    pub async fn status(
        &self,
        session_token: Option<&str>,
        resource_id: Option<&str>,
        cookies: &HashMap<String, String>,
    ) -> Result<Verdict, Denial> {
        let token = match session_token {
            Some(t) => t,
            None => return Ok(Verdict::denied("NO_LOGGED_IN_USER")),
        };
        let subject = match self.registry.subject_for_session(token)? {
            Some(s) => s,
            None => return Ok(Verdict::denied("USER_DOES_NOT_EXIST")),
        };
        // Never exchanged a token: not granted, no reason.
        if subject.external_sub.is_none() {
            return Ok(Verdict {
                granted: false,
                grant_reason: None,
                deny_code: None,
                subject: Some(subject),
            });
        }
        let resource_id = resource_id.unwrap_or("");
        self.decide(&subject, resource_id, cookies, false).await
    }

    /// Shared precedence: membership oracle first, then the unlock
    /// ledger. `metering_pending` controls whether a miss is labelled
    /// METERING (exchange) or left unlabelled (status).
    async fn decide(
        &self,
        subject: &SubjectRow,
        resource_id: &str,
        cookies: &HashMap<String, String>,
        metering_pending: bool,
    ) -> Result<Verdict, Denial> {
        if self.oracle.can_view(subject.id, resource_id).await? {
            return Ok(Verdict {
                granted: true,
                grant_reason: Some(GrantReason::Subscriber),
                deny_code: None,
                subject: Some(subject.clone()),
            });
        }
        if self.ledger.is_present(resource_id, subject.id, cookies) {
            return Ok(Verdict {
                granted: true,
                grant_reason: Some(GrantReason::Metering),
                deny_code: None,
                subject: Some(subject.clone()),
            });
        }
        Ok(Verdict {
            granted: false,
            grant_reason: metering_pending.then_some(GrantReason::Metering),
            deny_code: None,
            subject: Some(subject.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::testutil::{TokenSigner, identity_claims};
    use crate::verifier::JwksCache;
    use async_trait::async_trait;
    use std::time::Duration;

    const CLIENT_ID: &str = "client-id.apps.example";

    struct FixedOracle(bool);

    #[async_trait]
    impl MembershipOracle for FixedOracle {
        async fn can_view(&self, _: i64, _: &str) -> Result<bool, MembershipError> {
            Ok(self.0)
        }
    }

    struct DownOracle;

    #[async_trait]
    impl MembershipOracle for DownOracle {
        async fn can_view(&self, _: i64, _: &str) -> Result<bool, MembershipError> {
            Err(MembershipError::Unavailable("down".into()))
        }
    }

    fn engine_with(signer: &TokenSigner, oracle: Arc<dyn MembershipOracle>) -> Engine {
        let cache = Arc::new(JwksCache::new());
        cache.store(serde_json::from_value(signer.jwks()).unwrap());
        let verifier = Verifier::new(
            "http://127.0.0.1:9/.well-known/openid-configuration".into(),
            CLIENT_ID.into(),
            Duration::from_millis(200),
            cache,
        );
        Engine::new(
            verifier,
            Registry::new(Db::open_in_memory().unwrap()),
            Ledger::new(b"test-secret".to_vec(), "presspass_".to_string()),
            oracle,
        )
    }

    fn no_cookies() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn exchange_registers_new_reader_metering_pending() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(false)));
        let token = signer.mint(&identity_claims("new@example.com", "sub-1", CLIENT_ID));

        let out = engine.exchange(&token, "post-1", &no_cookies()).await.unwrap();
        assert!(!out.verdict.granted);
        assert_eq!(out.verdict.grant_reason, Some(GrantReason::Metering));
        assert!(out.session_token.is_some());

        let subject = engine.registry.find_by_email("new@example.com").unwrap().unwrap();
        assert_eq!(subject.external_sub.as_deref(), Some("sub-1"));
        // Registration closed again once the exchange is done.
        assert!(engine.registry.register_reader("x@example.com").is_err());
    }

    #[tokio::test]
    async fn subscriber_dominates_existing_metering_grant() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(true)));
        let token = signer.mint(&identity_claims("member@example.com", "sub-2", CLIENT_ID));

        // Seed a metering grant cookie for the pair the subject will get.
        let out = engine.exchange(&token, "post-1", &no_cookies()).await.unwrap();
        let subject = out.verdict.subject.unwrap();
        let mut cookies = HashMap::new();
        cookies.insert(engine.ledger.cookie_name("post-1", subject.id), "true".into());

        let out = engine.exchange(&token, "post-1", &cookies).await.unwrap();
        assert!(out.verdict.granted);
        assert_eq!(out.verdict.grant_reason, Some(GrantReason::Subscriber));
    }

    #[tokio::test]
    async fn elevated_account_never_granted() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(true)));
        let subject = {
            let _guard = engine.registry.allow_registration();
            engine.registry.register_reader("admin@example.com").unwrap()
        };
        engine.registry.set_role(subject.id, "administrator").unwrap();

        let token = signer.mint(&identity_claims("admin@example.com", "sub-3", CLIENT_ID));
        let out = engine.exchange(&token, "post-1", &no_cookies()).await.unwrap();
        assert!(!out.verdict.granted);
        assert_eq!(out.verdict.deny_code, Some("ELEVATED_ROLE"));
        assert!(out.session_token.is_none());
    }

    #[tokio::test]
    async fn token_sub_binding_is_first_write_wins() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(false)));

        let t1 = signer.mint(&identity_claims("r@example.com", "sub-first", CLIENT_ID));
        engine.exchange(&t1, "post-1", &no_cookies()).await.unwrap();
        let t2 = signer.mint(&identity_claims("r@example.com", "sub-second", CLIENT_ID));
        engine.exchange(&t2, "post-1", &no_cookies()).await.unwrap();

        let subject = engine.registry.find_by_email("r@example.com").unwrap().unwrap();
        assert_eq!(subject.external_sub.as_deref(), Some("sub-first"));
    }

    #[tokio::test]
    async fn issue_grant_idempotent_and_status_sees_it() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(false)));
        let token = signer.mint(&identity_claims("r@example.com", "sub-1", CLIENT_ID));
        let out = engine.exchange(&token, "post-1", &no_cookies()).await.unwrap();
        let subject = out.verdict.subject.unwrap();
        let session = out.session_token.unwrap();

        let first = engine
            .issue_grant(Some(subject.clone()), Some("post-1"))
            .await
            .unwrap();
        let second = engine
            .issue_grant(Some(subject.clone()), Some("post-1"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let GrantStatus::Unlocked { grant_key, .. } = first else {
            panic!("expected unlock");
        };
        let mut cookies = HashMap::new();
        cookies.insert(format!("presspass_{grant_key}"), "true".into());
        let verdict = engine
            .status(Some(&session), Some("post-1"), &cookies)
            .await
            .unwrap();
        assert!(verdict.granted);
        assert_eq!(verdict.grant_reason, Some(GrantReason::Metering));
    }

    #[tokio::test]
    async fn issue_grant_subscriber_skips_issuance() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(true)));
        let subject = {
            let _guard = engine.registry.allow_registration();
            engine.registry.register_reader("m@example.com").unwrap()
        };
        let status = engine.issue_grant(Some(subject), Some("post-1")).await.unwrap();
        assert_eq!(status, GrantStatus::Subscriber);
    }

    #[tokio::test]
    async fn issue_grant_requires_subject_and_resource() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(false)));
        assert_eq!(
            engine.issue_grant(None, Some("post-1")).await.unwrap(),
            GrantStatus::NoUserOrPost
        );
        let subject = {
            let _guard = engine.registry.allow_registration();
            engine.registry.register_reader("r@example.com").unwrap()
        };
        assert_eq!(
            engine.issue_grant(Some(subject), None).await.unwrap(),
            GrantStatus::NoUserOrPost
        );
    }

    #[tokio::test]
    async fn status_reason_codes() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(false)));

        let anon = engine.status(None, Some("post-1"), &no_cookies()).await.unwrap();
        assert!(!anon.granted);
        assert_eq!(anon.deny_code, Some("NO_LOGGED_IN_USER"));

        let unknown = engine
            .status(Some("bogus"), Some("post-1"), &no_cookies())
            .await
            .unwrap();
        assert!(!unknown.granted);
        assert_eq!(unknown.deny_code, Some("USER_DOES_NOT_EXIST"));
    }

    #[tokio::test]
    async fn status_unbound_subject_has_no_reason() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(FixedOracle(true)));
        let subject = {
            let _guard = engine.registry.allow_registration();
            engine.registry.register_reader("r@example.com").unwrap()
        };
        let session = engine.registry.set_current_session(subject.id).unwrap();
        let verdict = engine
            .status(Some(&session), Some("post-1"), &no_cookies())
            .await
            .unwrap();
        assert!(!verdict.granted);
        assert_eq!(verdict.grant_reason, None);
        assert_eq!(verdict.deny_code, None);
    }

    #[tokio::test]
    async fn oracle_outage_fails_closed() {
        let signer = TokenSigner::generate("k1");
        let engine = engine_with(&signer, Arc::new(DownOracle));
        let token = signer.mint(&identity_claims("r@example.com", "sub-1", CLIENT_ID));
        let err = engine.exchange(&token, "post-1", &no_cookies()).await.unwrap_err();
        assert_eq!(err.code, "MEMBERSHIP_UNAVAILABLE");
    }
}
