//! Command line / environment configuration.
//!
//! Every option can be given as a flag or through the environment (after the
//! env file has been loaded by `util::init_tracing`). Handlers only ever see
//! the resolved [`ProxyConfig`].

use crate::conversion::{ModelPolicy, ModelSelector};
use crate::key_store::KeyBackend;
use crate::upstream::{UpstreamMode, DEFAULT_BASE_URL};
use clap::Parser;

pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const DEFAULT_KEYS_BACKEND: &str = "file:./data/api-keys.json";
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_LIGHT_MODEL: &str = "gemini-2.5-flash";

#[derive(Parser, Debug, Clone)]
#[command(name = "gemrelay")]
#[command(about = "OpenAI and Anthropic compatible front end for Gemini with key rotation")]
#[command(version)]
pub struct Cli {
    /// Address the HTTP server listens on
    #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Shared secret for the /admin endpoints
    #[arg(long, env = "ADMIN_PASSWORD", default_value = DEFAULT_ADMIN_PASSWORD, hide_env_values = true)]
    pub admin_password: String,

    /// Key persistence: "file:<path>" or "memory"
    #[arg(long, env = "GEMRELAY_KEYS_BACKEND", default_value = DEFAULT_KEYS_BACKEND, value_parser = parse_backend)]
    pub keys_backend: KeyBackend,

    #[arg(long, env = "GEMRELAY_UPSTREAM_MODE", value_enum, default_value_t = UpstreamMode::Rest)]
    pub upstream_mode: UpstreamMode,

    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub upstream_base_url: String,

    /// Model choice for /v1/* routes
    #[arg(long, env = "GEMRELAY_MODEL_POLICY", value_enum, default_value_t = ModelPolicy::Heuristic)]
    pub model_policy: ModelPolicy,

    #[arg(long, env = "GEMRELAY_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub default_model: String,

    #[arg(long, env = "GEMRELAY_LIGHT_MODEL", default_value = DEFAULT_LIGHT_MODEL)]
    pub light_model: String,
}

fn parse_backend(spec: &str) -> Result<KeyBackend, String> {
    KeyBackend::from_spec(spec)
        .ok_or_else(|| format!("invalid keys backend '{spec}': expected file:<path> or memory"))
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind: String,
    pub admin_password: String,
    pub keys_backend: KeyBackend,
    pub upstream_mode: UpstreamMode,
    pub upstream_base_url: String,
    pub models: ModelSelector,
}

impl ProxyConfig {
    pub fn uses_default_password(&self) -> bool {
        self.admin_password == DEFAULT_ADMIN_PASSWORD
    }
}

impl From<Cli> for ProxyConfig {
    fn from(cli: Cli) -> Self {
        Self {
            bind: cli.bind,
            admin_password: cli.admin_password,
            keys_backend: cli.keys_backend,
            upstream_mode: cli.upstream_mode,
            upstream_base_url: cli.upstream_base_url,
            models: ModelSelector::new(cli.model_policy, &cli.default_model, &cli.light_model),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            keys_backend: KeyBackend::Memory,
            upstream_mode: UpstreamMode::Rest,
            upstream_base_url: DEFAULT_BASE_URL.to_string(),
            models: ModelSelector::new(ModelPolicy::Heuristic, DEFAULT_MODEL, DEFAULT_LIGHT_MODEL),
        }
    }
}
