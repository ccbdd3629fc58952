//! Membership oracle: the external authority on subscription access.
//!
//! The engine only ever asks one question: may this subject view this
//! resource. When no provider is configured the null oracle answers no,
//! so metering grants are the only way to unlock content.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::MembershipError;

#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Whether the subject's subscription covers the resource. An
    /// unanswered or failed call is an error, never an implicit yes.
    async fn can_view(&self, subject_id: i64, resource_id: &str) -> Result<bool, MembershipError>;
}

/// Default when no membership provider is configured: always no.
pub struct NullOracle;

#[async_trait]
impl MembershipOracle for NullOracle {
    async fn can_view(&self, _: i64, _: &str) -> Result<bool, MembershipError> {
        Ok(false)
    }
}

/// HTTP-backed oracle. Posts the pair to the configured endpoint and
/// expects `{"canView": bool}`. Single attempt, hard timeout.
pub struct HttpOracle {
    url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpOracle {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MembershipOracle for HttpOracle {
    async fn can_view(
        &self,
        subject_id: i64,
        resource_id: &str,
    ) -> Result<bool, MembershipError> {
        let body = serde_json::json!({
            "subjectId": subject_id,
            "resourceId": resource_id,
        });
        let resp = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| MembershipError::Unavailable(format!("oracle call failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MembershipError::Unavailable(format!(
                "oracle returned {}",
                resp.status()
            )));
        }
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MembershipError::Unavailable(format!("oracle parse failed: {e}")))?;
        json["canView"]
            .as_bool()
            .ok_or_else(|| MembershipError::Unavailable("no canView in oracle response".into()))
    }
}
