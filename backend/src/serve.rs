//! HTTP surface assembly: the `/api` router (spec.md §6), CORS, tracing,
//! and panic isolation, plus the binary's async entry point.

use axum::Router;
use axum::http::StatusCode;
use eyre::{Result, WrapErr};
use tower_http::cors::{self, CorsLayer};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::{AppState, Config};

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
async fn health() -> StatusCode {
    StatusCode::OK
}

/// The full `/api`-relative router. Host CRUD and the sync trigger are
/// separate sub-routers (spec.md §6 mounts `POST /virtualization/sync`
/// alongside, not under, `/virtualization/hosts`).
pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .nest("/virtualization/hosts", crate::host::serve::router())
        .nest("/virtualization", crate::host::serve::sync_router())
        .nest("/virtualization/vms", crate::virtualization::vm::serve::router())
        .nest("/virtualization/datastores", crate::virtualization::datastore::router())
        .nest("/tasks", crate::task::serve::router())
        .nest("/credentials", crate::credential::serve::router())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(cors::Any).allow_headers(cors::Any);
    if config.cors_origins.is_empty() {
        layer.allow_origin(cors::Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.app_host, state.config.app_port);
    let cors = cors_layer(&state.config);

    let (api_router, _openapi) = router().split_for_parts();
    let app = Router::new().nest("/api", api_router.with_state(state.clone())).layer(
        tower::ServiceBuilder::new()
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .layer(tower_http::catch_panic::CatchPanicLayer::new())
            .layer(cors),
    );

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.wrap_err("server exited")
}

/// Builds the DB pool, runs migrations, and serves forever. Mirrors the
/// teacher's `serve::main(config) -> Result<()>` shape: a synchronous
/// entry point that owns the Tokio runtime itself so `main.rs` stays a
/// thin CLI dispatcher.
pub fn main(config: Config) -> Result<()> {
    let pool = crate::config::build_pool(&config.database_url, config.db_pool_size)
        .wrap_err("failed to build database pool")?;
    crate::config::run_migrations(&pool).wrap_err("failed to run pending migrations")?;
    let state = AppState::new(config, pool);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create Tokio runtime")?
        .block_on(serve(state))
}
