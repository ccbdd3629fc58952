//! REST surface for the decision engine.
//!
//! Three endpoints under `/v1`: token exchange (`POST /v1/login/google`),
//! explicit unlock (`GET /v1/subscription/register`) and status query
//! (`GET /v1/login/status`), plus `/health`. Every endpoint responds 200
//! with a structured body; callers branch on body fields, never on
//! transport status. Login and status responses carry a fresh
//! anti-forgery nonce in `X-Auth-Nonce`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::Json;
use axum::routing::{get, post};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tower_http::cors::CorsLayer;

use crate::config::{self, ServerConfig};
use crate::db::Db;
use crate::engine::{Denial, Engine, GrantStatus, Verdict};
use crate::ledger::Ledger;
use crate::membership::{HttpOracle, MembershipOracle, NullOracle};
use crate::registry::Registry;
use crate::verifier::{JwksCache, Verifier};

/// Nonces older than this fail verification.
const NONCE_MAX_AGE_SECS: i64 = 12 * 3600;

/// Bytes of HMAC output carried in a nonce tag.
const NONCE_TAG_LEN: usize = 16;

pub struct SharedState {
    pub config: ServerConfig,
    pub engine: Engine,
    pub secret: Vec<u8>,
}

/// Wire the engine together from configuration.
pub fn build_state(config: ServerConfig) -> anyhow::Result<Arc<SharedState>> {
    let secret = config::load_or_generate_secret(Path::new(&config.secret_path));
    let db = Db::open(&config.db_path)?;
    let timeout = Duration::from_secs(config.upstream_timeout_secs);

    let verifier = Verifier::new(
        config.discovery_url.clone(),
        config.client_id.clone(),
        timeout,
        Arc::new(JwksCache::new()),
    );
    let oracle: Arc<dyn MembershipOracle> = match &config.membership_url {
        Some(url) => Arc::new(HttpOracle::new(url.clone(), timeout)),
        None => Arc::new(NullOracle),
    };
    let ledger = Ledger::new(secret.clone(), config.cookie_prefix.clone());
    let engine = Engine::new(verifier, Registry::new(db), ledger, oracle);

    Ok(Arc::new(SharedState {
        config,
        engine,
        secret,
    }))
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/login/google", post(login_google))
        .route("/v1/subscription/register", get(register_subscription))
        .route("/v1/login/status", get(login_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve. Returns the bound address and the serve task handle;
/// binding to port 0 picks an ephemeral port.
pub async fn start(
    state: Arc<SharedState>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    let addr = listener.local_addr()?;
    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("http server exited: {e}");
        }
    });
    Ok((addr, handle))
}

async fn health() -> &'static str {
    "ok"
}

/// Operation A: raw identity token in the body, verdict out. Sets the
/// site session cookie on success.
async fn login_google(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: String,
) -> (HeaderMap, Json<serde_json::Value>) {
    let cookies = parse_cookies(&headers);
    let resource_id = header_str(&headers, "X-Resource-Id").unwrap_or("").to_string();
    let mut response_headers = nonce_headers(&state.secret);

    let body = match state.engine.exchange(&body, &resource_id, &cookies).await {
        Ok(outcome) => {
            if let Some(token) = &outcome.session_token {
                let cookie = format!(
                    "{}={}; Path=/; HttpOnly; SameSite=Lax",
                    state.config.session_cookie, token
                );
                if let Ok(v) = HeaderValue::from_str(&cookie) {
                    response_headers.append(header::SET_COOKIE, v);
                }
            }
            verdict_body(&outcome.verdict, Some(&resource_id))
        }
        Err(denial) => denial_body(&denial),
    };
    (response_headers, Json(body))
}

/// Operation B: explicit unlock. Session-authenticated when a session
/// cookie is present; the `X-User-Email` header is only honored without
/// one. `UNLOCKED` responses carry the grant cookie.
async fn register_subscription(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> (HeaderMap, Json<serde_json::Value>) {
    let mut response_headers = HeaderMap::new();
    let body = match try_register(&state, &headers).await {
        Ok((body, set_cookie)) => {
            if let Some(cookie) = set_cookie
                && let Ok(v) = HeaderValue::from_str(&cookie)
            {
                response_headers.append(header::SET_COOKIE, v);
            }
            body
        }
        // Failures during issuance become a structured error payload.
        Err(denial) => json!({ "status": "ERROR", "reason": denial.code }),
    };
    (response_headers, Json(body))
}

async fn try_register(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<(serde_json::Value, Option<String>), Denial> {
    let cookies = parse_cookies(headers);
    let resource_id = header_str(headers, "X-Resource-Id");

    let subject = match cookies.get(&state.config.session_cookie) {
        Some(token) => state.engine.registry.subject_for_session(token)?,
        None => None,
    };
    let subject = match subject {
        Some(s) => Some(s),
        None => match header_str(headers, "X-User-Email") {
            Some(email) => state.engine.registry.find_by_email(email)?,
            None => None,
        },
    };

    match state.engine.issue_grant(subject, resource_id).await? {
        GrantStatus::Subscriber => Ok((json!({ "status": "SUBSCRIBER" }), None)),
        GrantStatus::Unlocked {
            grant_key,
            set_cookie,
        } => Ok((
            json!({ "status": "UNLOCKED", "grantKey": grant_key }),
            Some(set_cookie),
        )),
        GrantStatus::NoUserOrPost => Ok((json!({ "status": "NO_USER_OR_POST" }), None)),
    }
}

/// Operation C: session-authenticated status query.
async fn login_status(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> (HeaderMap, Json<serde_json::Value>) {
    let cookies = parse_cookies(&headers);
    let resource_id = header_str(&headers, "X-Resource-Id");
    let session_token = cookies.get(&state.config.session_cookie).cloned();
    let response_headers = nonce_headers(&state.secret);

    let body = match state
        .engine
        .status(session_token.as_deref(), resource_id, &cookies)
        .await
    {
        Ok(verdict) => verdict_body(&verdict, resource_id),
        Err(denial) => denial_body(&denial),
    };
    (response_headers, Json(body))
}

fn verdict_body(verdict: &Verdict, resource_id: Option<&str>) -> serde_json::Value {
    let mut body = json!({ "granted": verdict.granted });
    if let Some(reason) = verdict.grant_reason {
        body["grantReason"] = json!(reason.as_str());
    }
    if let Some(code) = verdict.deny_code {
        body["reason"] = json!(code);
    }
    if let Some(subject) = &verdict.subject {
        if let Some(sub) = &subject.external_sub {
            body["id"] = json!(base64::engine::general_purpose::STANDARD.encode(sub));
        }
        body["email"] = json!(subject.email);
        body["registrationTimestamp"] = json!(subject.registered_at);
    }
    if let Some(rid) = resource_id {
        body["resourceId"] = json!(rid);
    }
    body
}

fn denial_body(denial: &Denial) -> serde_json::Value {
    json!({ "granted": false, "reason": denial.code })
}

fn nonce_headers(secret: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&mint_nonce(secret)) {
        headers.insert("X-Auth-Nonce", v);
    }
    headers
}

/// Parse the request Cookie header(s) into a name → value map.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(s) = value.to_str() else { continue };
        for pair in s.split(';') {
            if let Some((name, v)) = pair.trim().split_once('=') {
                out.insert(name.to_string(), v.to_string());
            }
        }
    }
    out
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Mint a fresh anti-forgery nonce: `hex(random).timestamp.hex(mac)`.
pub(crate) fn mint_nonce(secret: &[u8]) -> String {
    let random: [u8; 8] = rand::random();
    let body = format!(
        "{}.{}",
        hex::encode(random),
        chrono::Utc::now().timestamp()
    );
    format!("{body}.{}", nonce_mac(secret, &body))
}

/// Check a nonce's MAC (in constant time) and age.
pub(crate) fn verify_nonce(secret: &[u8], nonce: &str) -> bool {
    let mut parts = nonce.rsplitn(2, '.');
    let (Some(tag_hex), Some(body)) = (parts.next(), parts.next()) else {
        return false;
    };
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    if tag.len() != NONCE_TAG_LEN {
        return false;
    }
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    if mac.verify_truncated_left(&tag).is_err() {
        return false;
    }
    match body.rsplit('.').next().and_then(|t| t.parse::<i64>().ok()) {
        Some(ts) => (chrono::Utc::now().timestamp() - ts).abs() < NONCE_MAX_AGE_SECS,
        None => false,
    }
}

fn nonce_mac(secret: &[u8], body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    hex::encode(&mac.finalize().into_bytes()[..NONCE_TAG_LEN])
}
