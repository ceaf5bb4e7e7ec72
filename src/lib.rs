#![forbid(unsafe_code)]
#![doc = r#"
gemrelay

Serve the OpenAI Chat Completions and Anthropic Messages APIs on top of
Google Gemini, dispensing upstream keys from a persisted round-robin pool.

Modules
- `models`: wire types for both client APIs, Gemini and the admin endpoints.
- `key_store`: the key pool, its rotation cursor and storage backends.
- `conversion`: client request → Gemini request → client response, plus model selection.
- `sse`: upstream SSE line decoding and snapshot diffing.
- `relay`: re-framing of text increments as client-format SSE events.
- `upstream`: the Gemini HTTP client in its two integration modes.
- `server`: actix-web routes and handlers.
- `config` / `util`: CLI/env configuration, tracing, CORS, shared state.
"#]

pub mod config;
pub mod conversion;
pub mod error;
pub mod key_store;
pub mod models;
pub mod relay;
pub mod server;
pub mod sse;
pub mod upstream;
pub mod util;

pub use crate::config::{Cli, ProxyConfig};
pub use crate::conversion::{ModelPolicy, ModelSelector};
pub use crate::error::{ProxyError, Result};
pub use crate::key_store::{KeyBackend, KeyStore};
pub use crate::upstream::{
    build_upstream, GeminiRestClient, GeminiTranscriptClient, UpstreamClient, UpstreamMode,
};

// Re-export model namespaces for convenience (downstream users can do `use gemrelay::chat`).
pub use crate::models::{anthropic, chat, gemini};
