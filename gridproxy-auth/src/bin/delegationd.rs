//! Delegation Service Binary
//!
//! HTTP server for `DelegateCredentialsInit` and `UpdateCredentials`.
//!
//! Usage: `gridproxy-delegationd [CONFIG]`, or set `GRIDPROXY_CONFIG`.

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::{Context, Result};
use gridproxy_auth::{
    endpoint::{INIT_PATH, UPDATE_PATH},
    service::{DelegationFault, DelegationService, InitRequest, UpdateRequest},
    DelegationConfig, DelegationError, PROTOCOL_VERSION,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Main entry point
#[actix_web::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("GRIDPROXY_CONFIG").map(PathBuf::from));
    let config = DelegationConfig::resolve(path.as_deref()).context("loading configuration")?;

    let service = Arc::new(DelegationService::from_config(&config).context("loading trust anchors")?);
    info!(
        "Loaded {} trust anchors, {} credentials per identity",
        service.trust().len(),
        config.cache.max_credentials_per_identity
    );

    // Background expiry sweep
    let sweeper = service.clone();
    let interval = config.cache.sweep_interval;
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            sweeper.sweep();
        }
    });

    let bind = config.server.bind_address.clone();
    info!("Starting delegation service on http://{}", bind);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(service.clone()))
            .configure(routes)
    })
    .bind(bind.as_str())
    .with_context(|| format!("binding {}", bind))?
    .run()
    .await?;

    Ok(())
}

/// Delegation routes. Rejected JSON bodies are answered with a
/// `malformed_request` fault like any other service error.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let response = fault_response(&DelegationError::MalformedRequest(err.to_string()));
        actix_web::error::InternalError::from_response(err, response).into()
    }))
    .route("/health", web::get().to(health_check))
    .route(INIT_PATH, web::post().to(delegate_credentials_init))
    .route(UPDATE_PATH, web::post().to(update_credentials));
}

/// Health check endpoint
async fn health_check(service: web::Data<DelegationService>) -> impl Responder {
    let counts = service.cache().counts();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "sessions": counts,
    }))
}

/// `DelegateCredentialsInit` endpoint
async fn delegate_credentials_init(
    service: web::Data<DelegationService>,
    request: web::Json<InitRequest>,
) -> HttpResponse {
    let service = service.into_inner();
    let request = request.into_inner();
    respond(web::block(move || service.delegate_credentials_init(&request)).await)
}

/// `UpdateCredentials` endpoint
async fn update_credentials(
    service: web::Data<DelegationService>,
    request: web::Json<UpdateRequest>,
) -> HttpResponse {
    let service = service.into_inner();
    let request = request.into_inner();
    respond(web::block(move || service.update_credentials(&request)).await)
}

fn respond<T: Serialize>(
    outcome: std::result::Result<gridproxy_auth::Result<T>, actix_web::error::BlockingError>,
) -> HttpResponse {
    let err = match outcome {
        Ok(Ok(body)) => return HttpResponse::Ok().json(body),
        Ok(Err(e)) => e,
        Err(e) => DelegationError::Internal(format!("worker failed: {}", e)),
    };
    fault_response(&err)
}

fn fault_response(err: &DelegationError) -> HttpResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Delegation request failed: {}", err);
    } else {
        warn!("Delegation request rejected: {}", err);
    }
    HttpResponse::build(status).json(DelegationFault::from(err))
}
