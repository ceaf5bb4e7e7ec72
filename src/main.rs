use actix_web::{web, App, HttpServer};
use clap::Parser;
use gemrelay::config::{Cli, ProxyConfig};
use gemrelay::key_store::KeyStore;
use gemrelay::server::config_routes;
use gemrelay::util::{build_http_client_from_env, cors_config_from_env, init_tracing, AppState};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Env file first so clap's env fallbacks see it.
    init_tracing();
    let config = ProxyConfig::from(Cli::parse());

    if config.uses_default_password() {
        tracing::warn!("ADMIN_PASSWORD is not set; using the default admin password");
    }

    let keys = Arc::new(KeyStore::from_backend(config.keys_backend.clone()));
    if keys.is_empty() {
        tracing::warn!("Key pool is empty; add keys through /admin/keys/add");
    }

    let state = web::Data::new(AppState::from_config(
        &config,
        keys,
        build_http_client_from_env(),
    ));

    tracing::info!(
        bind = %config.bind,
        upstream_mode = config.upstream_mode.as_str(),
        upstream = %config.upstream_base_url,
        default_model = %config.models.default_model,
        light_model = %config.models.light_model,
        "Starting gemrelay"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&config.bind)?
    .run()
    .await?;

    Ok(())
}
