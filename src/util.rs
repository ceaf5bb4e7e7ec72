use crate::config::ProxyConfig;
use crate::conversion::ModelSelector;
use crate::error::ProxyError;
use crate::key_store::KeyStore;
use crate::models::ClientFormat;
use crate::upstream::{build_upstream, UpstreamClient};
use actix_web::HttpResponse;
use http::StatusCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// Env file named by ENV_FILE or DOTENV_PATH, first non-blank wins.
fn explicit_env_file(lookup: impl Fn(&str) -> Option<String>) -> Option<(String, &'static str)> {
    ["ENV_FILE", "DOTENV_PATH"].into_iter().find_map(|key| {
        let path = lookup(key)?.trim().to_string();
        (!path.is_empty()).then_some((path, key))
    })
}

/// Load the env file and initialize tracing from RUST_LOG.
///
/// The env file is ENV_FILE or DOTENV_PATH when set, otherwise `.env` in the
/// working directory. Existing variables win.
pub fn init_tracing() {
    let loaded = match explicit_env_file(|key| std::env::var(key).ok()) {
        Some((path, key)) => dotenvy::from_filename(&path)
            .map(|_| format!("{path} ({key})"))
            .map_err(|e| format!("{path} ({key}): {e}")),
        None => dotenvy::dotenv()
            .map(|p| p.display().to_string())
            .map_err(|e| e.to_string()),
    };

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match loaded {
        Ok(source) => tracing::info!(%source, "Environment file loaded"),
        Err(reason) => tracing::debug!(%reason, "No environment file loaded"),
    }
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub keys: Arc<KeyStore>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub models: ModelSelector,
    pub admin_password: String,
}

impl AppState {
    pub fn from_config(config: &ProxyConfig, keys: Arc<KeyStore>, http: reqwest::Client) -> Self {
        Self {
            keys,
            upstream: build_upstream(config.upstream_mode, http, &config.upstream_base_url),
            models: config.models.clone(),
            admin_password: config.admin_password.clone(),
        }
    }

    /// Constant-time comparison against the configured admin password.
    pub fn check_password(&self, candidate: Option<&str>) -> Result<(), ProxyError> {
        match candidate {
            Some(p) if ct_eq(p.as_bytes(), self.admin_password.as_bytes()) => Ok(()),
            _ => Err(ProxyError::Unauthorized),
        }
    }
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Upstream HTTP client configured from the environment.
///
/// - GEMRELAY_HTTP_TIMEOUT_SECONDS: overall request timeout, none when unset
/// - GEMRELAY_NO_PROXY: truthy disables every proxy below
/// - GEMRELAY_PROXY_URL: proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY (or lowercase): per-scheme proxies
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .user_agent(format!("gemrelay/{}", env!("CARGO_PKG_VERSION")));

    if let Some(secs) = env_value("GEMRELAY_HTTP_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
        builder = builder.timeout(std::time::Duration::from_secs(secs));
    }

    if env_value("GEMRELAY_NO_PROXY").is_some_and(|v| truthy(&v)) {
        builder = builder.no_proxy();
    } else {
        let proxies = [
            env_value("GEMRELAY_PROXY_URL").map(|u| reqwest::Proxy::all(u.as_str())),
            env_value("HTTP_PROXY")
                .or_else(|| env_value("http_proxy"))
                .map(|u| reqwest::Proxy::http(u.as_str())),
            env_value("HTTPS_PROXY")
                .or_else(|| env_value("https_proxy"))
                .map(|u| reqwest::Proxy::https(u.as_str())),
        ];
        for proxy in proxies.into_iter().flatten() {
            match proxy {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid proxy URL"),
            }
        }
    }

    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Falling back to default HTTP client");
        reqwest::Client::new()
    })
}

fn actix_status(status: StatusCode) -> actix_web::http::StatusCode {
    actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
}

/// Render `err` in the envelope of the caller's wire format.
pub fn format_error_response(format: ClientFormat, err: &ProxyError) -> HttpResponse {
    let message = err.client_message();
    let body = match format {
        ClientFormat::OpenAi => serde_json::json!({
            "error": { "message": message, "type": err.kind(), "code": null }
        }),
        ClientFormat::Anthropic => serde_json::json!({
            "type": "error",
            "error": { "type": err.kind(), "message": message }
        }),
    };
    HttpResponse::build(actix_status(err.status())).json(body)
}

/// Admin endpoints use a flat `{"error": msg}` body.
pub fn admin_error_response(err: &ProxyError) -> HttpResponse {
    HttpResponse::build(actix_status(err.status()))
        .json(serde_json::json!({ "error": err.client_message() }))
}

/// Build CORS configuration from environment variables.
///
/// Supported variables:
/// - CORS_ALLOWED_ORIGINS: comma-separated origins, or "*" (default: any)
/// - CORS_ALLOWED_METHODS: comma-separated methods, or "*" (default: any)
/// - CORS_ALLOWED_HEADERS: comma-separated headers, or "*" (default: any)
/// - CORS_ALLOW_CREDENTIALS: 1|true|yes|on
/// - CORS_MAX_AGE: seconds
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_origin(part);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods: Vec<&str> = methods
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in headers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if std::env::var("CORS_ALLOW_CREDENTIALS")
        .map(|v| truthy(&v))
        .unwrap_or(false)
    {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
