use crate::conversion::{
    from_upstream_response, parse_anthropic_request, parse_chat_request, ModelVariant,
    ParsedRequest, RouteModel,
};
use crate::error::ProxyError;
use crate::models::admin::{AddKeyRequest, AdminRequest, DeleteKeyRequest, KeyChangeResponse};
use crate::models::ClientFormat;
use crate::relay::{relay_stream, StreamState};
use crate::util::{admin_error_response, format_error_response, AppState};
use actix_web::{web, HttpResponse, Responder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Instrument;

const ROUTES: &[&str] = &[
    "/status",
    "/admin/keys",
    "/admin/keys/add",
    "/admin/keys/delete",
    "/v1/chat/completions",
    "/v1/messages",
    "/pro/v1/messages",
    "/flash/v1/messages",
];

/// Configure all HTTP routes for the proxy.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/admin/keys", web::post().to(admin_list_keys))
            .route("/admin/keys/add", web::post().to(admin_add_key))
            .route("/admin/keys/delete", web::post().to(admin_delete_key))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/v1/messages", web::post().to(messages))
            .route("/pro/v1/messages", web::post().to(pro_messages))
            .route("/flash/v1/messages", web::post().to(flash_messages)),
    );
}

/// Service status: routes, upstream mode, model policy and pool size.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let pool = state.keys.snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ROUTES,
        "upstream_mode": state.upstream.mode().as_str(),
        "models": {
            "policy": state.models.policy,
            "default": state.models.default_model,
            "light": state.models.light_model,
        },
        "keys": {
            "total": pool.keys.len(),
            "current_index": pool.cursor,
        },
    }))
}

// ============================================================================
// Proxy endpoints
// ============================================================================

async fn chat_completions(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    proxy(state, body, ClientFormat::OpenAi, RouteModel::Policy).await
}

async fn messages(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    proxy(state, body, ClientFormat::Anthropic, RouteModel::Policy).await
}

async fn pro_messages(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let route = RouteModel::Bound(ModelVariant::Default);
    proxy(state, body, ClientFormat::Anthropic, route).await
}

async fn flash_messages(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let route = RouteModel::Bound(ModelVariant::Light);
    proxy(state, body, ClientFormat::Anthropic, route).await
}

/// Any body that parses as JSON is accepted regardless of content type.
/// Failures are `InvalidRequest` and render in the route's envelope.
fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid JSON body: {e}")))
}

async fn proxy(
    state: web::Data<AppState>,
    body: web::Bytes,
    format: ClientFormat,
    route: RouteModel,
) -> HttpResponse {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!(
        "proxy",
        %request_id,
        format = format.as_str(),
        model = tracing::field::Empty
    );
    async move {
        match decode_body::<Value>(&body) {
            Ok(body) => handle(state, body, format, route).await,
            Err(err) => {
                tracing::debug!(error = %err, "Rejected client request");
                format_error_response(format, &err)
            }
        }
    }
    .instrument(span)
    .await
}

/// Validate → acquire key → dispatch → respond directly or stream.
async fn handle(
    state: web::Data<AppState>,
    body: Value,
    format: ClientFormat,
    route: RouteModel,
) -> HttpResponse {
    let parsed = match format {
        ClientFormat::OpenAi => parse_chat_request(body, &state.models, route),
        ClientFormat::Anthropic => parse_anthropic_request(body, &state.models, route),
    };
    let ParsedRequest {
        request,
        client_model,
    } = match parsed {
        Ok(p) => p,
        Err(err) => {
            tracing::debug!(error = %err, "Rejected client request");
            return format_error_response(format, &err);
        }
    };
    tracing::Span::current().record("model", request.target_model.as_str());

    let api_key = match state.keys.next() {
        Ok(k) => k,
        Err(err) => {
            tracing::warn!(error = %err, "No upstream key to dispatch with");
            let err = ProxyError::ServiceUnavailable("key pool is empty".to_string());
            return format_error_response(format, &err);
        }
    };

    if request.streaming {
        match state.upstream.generate_stream(&api_key, &request).await {
            Ok(increments) => {
                let stream_state = StreamState::new(format, &client_model);
                tracing::info!(id = %stream_state.id, "Streaming response");
                HttpResponse::Ok()
                    .insert_header(("content-type", "text/event-stream"))
                    .insert_header(("cache-control", "no-cache"))
                    .insert_header(("connection", "keep-alive"))
                    .streaming(relay_stream(increments, stream_state))
            }
            Err(err) => {
                tracing::error!(error = %err, "Upstream stream could not be opened");
                format_error_response(format, &err)
            }
        }
    } else {
        match state.upstream.generate(&api_key, &request).await {
            Ok(raw) => HttpResponse::Ok().json(from_upstream_response(&raw, &client_model, format)),
            Err(err) => {
                tracing::error!(error = %err, "Upstream call failed");
                format_error_response(format, &err)
            }
        }
    }
}

// ============================================================================
// Admin endpoints
// ============================================================================

async fn admin_list_keys(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let body: AdminRequest = match decode_body(&body) {
        Ok(b) => b,
        Err(err) => return admin_error_response(&err),
    };
    if let Err(err) = state.check_password(body.password.as_deref()) {
        return admin_error_response(&err);
    }
    HttpResponse::Ok().json(state.keys.list())
}

async fn admin_add_key(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let body: AddKeyRequest = match decode_body(&body) {
        Ok(b) => b,
        Err(err) => return admin_error_response(&err),
    };
    if let Err(err) = state.check_password(body.password.as_deref()) {
        return admin_error_response(&err);
    }
    match state.keys.add(body.api_key.as_deref().unwrap_or_default()) {
        Ok(total) => HttpResponse::Ok().json(KeyChangeResponse {
            message: "API key added successfully".to_string(),
            total,
        }),
        Err(err) => admin_error_response(&err),
    }
}

async fn admin_delete_key(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let body: DeleteKeyRequest = match decode_body(&body) {
        Ok(b) => b,
        Err(err) => return admin_error_response(&err),
    };
    if let Err(err) = state.check_password(body.password.as_deref()) {
        return admin_error_response(&err);
    }
    let index = match body.parsed_index() {
        Some(i) => i,
        None => {
            return admin_error_response(&ProxyError::IndexOutOfRange {
                index: -1,
                len: state.keys.len(),
            })
        }
    };
    match state.keys.remove(index) {
        Ok(total) => HttpResponse::Ok().json(KeyChangeResponse {
            message: "API key deleted successfully".to_string(),
            total,
        }),
        Err(err) => admin_error_response(&err),
    }
}
