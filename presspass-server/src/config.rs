//! Server configuration, from CLI flags or environment variables.

use clap::Parser;

/// Default issuer discovery document (Google OpenID configuration).
pub const DEFAULT_DISCOVERY_URL: &str =
    "https://accounts.google.com/.well-known/openid-configuration";

#[derive(Parser, Debug, Clone)]
#[command(name = "presspass-server", about = "Audience access server")]
pub struct ServerConfig {
    /// Address to listen on for HTTP.
    #[arg(long, env = "PRESSPASS_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Path to the SQLite database (subjects + sessions).
    #[arg(long, env = "PRESSPASS_DB_PATH", default_value = "presspass.db")]
    pub db_path: String,

    /// OpenID discovery document of the identity-token issuer.
    #[arg(long, env = "PRESSPASS_DISCOVERY_URL", default_value = DEFAULT_DISCOVERY_URL)]
    pub discovery_url: String,

    /// OAuth client id identity tokens must be issued to (azp/aud claim).
    #[arg(long, env = "PRESSPASS_CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// Membership oracle endpoint. When unset, every membership check
    /// answers "no" and only metering grants can unlock content.
    #[arg(long, env = "PRESSPASS_MEMBERSHIP_URL")]
    pub membership_url: Option<String>,

    /// Path to the server secret used for grant keys, session nonces and
    /// anti-forgery nonces. Generated and persisted on first start.
    #[arg(long, env = "PRESSPASS_SECRET_PATH", default_value = "presspass-secret.key")]
    pub secret_path: String,

    /// Hard timeout for issuer and membership-oracle calls, in seconds.
    /// An unanswered call is a failure, never an open gate.
    #[arg(long, env = "PRESSPASS_UPSTREAM_TIMEOUT_SECS", default_value_t = 10)]
    pub upstream_timeout_secs: u64,

    /// Prefix for unlock-grant cookie names.
    #[arg(long, env = "PRESSPASS_COOKIE_PREFIX", default_value = "presspass_")]
    pub cookie_prefix: String,

    /// Name of the session cookie.
    #[arg(long, env = "PRESSPASS_SESSION_COOKIE", default_value = "presspass_session")]
    pub session_cookie: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            db_path: "presspass.db".to_string(),
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            client_id: String::new(),
            membership_url: None,
            secret_path: "presspass-secret.key".to_string(),
            upstream_timeout_secs: 10,
            cookie_prefix: "presspass_".to_string(),
            session_cookie: "presspass_session".to_string(),
        }
    }
}

/// Load the server secret from `path`, generating and persisting a fresh
/// 32-byte secret when the file is missing or unreadable.
pub fn load_or_generate_secret(path: &std::path::Path) -> Vec<u8> {
    if path.exists() {
        if let Ok(data) = std::fs::read(path)
            && data.len() >= 32
        {
            tracing::info!("Loaded server secret from {}", path.display());
            return data;
        }
        tracing::warn!("Corrupt server secret at {}, regenerating", path.display());
    }
    let secret: [u8; 32] = rand::random();
    if let Err(e) = std::fs::write(path, secret) {
        tracing::error!("Failed to persist server secret to {}: {}", path.display(), e);
    } else {
        tracing::info!("Generated new server secret at {}", path.display());
    }
    secret.to_vec()
}
