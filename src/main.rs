mod cache;
mod catalog;
mod config;
mod display;
mod engine;
mod error;
mod scheduler;
mod settings;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_scalar::{Scalar, Servable};

use crate::cache::CacheStore;
use crate::catalog::HttpCatalog;
use crate::config::AppConfig;
use crate::display::{DisplayObserver, ScreenState, ScreenSurface};
use crate::engine::{Command, EngineHandle, EngineStatus, RotationEngine};
use crate::error::AppError;
use crate::settings::{BackgroundSource, DisplayOptions, RotationState, Settings};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
    screens: Arc<Vec<watch::Receiver<ScreenState>>>,
}

impl AppState {
    fn screen(&self, index: usize) -> Result<ScreenState, AppError> {
        self.screens
            .get(index)
            .map(|rx| rx.borrow().clone())
            .ok_or_else(|| AppError::NotFound(format!("screen {}", index)))
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Desktop Background API",
        description = "Control and inspect the desktop background and its community rotation",
        version = "0.1.0"
    ),
    tags(
        (name = "Background", description = "Background selection and rotation"),
        (name = "Screens", description = "What each screen is showing")
    ),
    paths(
        health,
        get_status,
        refresh_background,
        next_background,
        refresh_catalog,
        update_settings,
        get_screen,
        get_screen_image
    ),
    components(schemas(EngineStatus, ScreenState, SettingsUpdate))
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting with {:?}", config);

    let settings = Settings::load(&config.settings_path)?;
    tracing::info!("Loaded settings from {:?}", settings.path());
    let source = RotationState::load(&settings).source;
    let display = DisplayOptions::load(&settings);

    let catalog = Arc::new(HttpCatalog::new(&config.catalog_url)?);
    let cache = CacheStore::new(&config.cache_dir);
    tracing::info!(
        "Community catalog at {}, cache in {}",
        catalog.base(),
        cache.root().display()
    );

    // Screen 0 belongs to the engine, the rest observe it
    let (surface, primary) = ScreenSurface::new(0);
    let (mut engine, handle, inbox) = RotationEngine::new(catalog, cache.clone(), settings, surface);

    let mut screens = vec![primary];
    for index in 1..config.screens {
        let (surface, rx) = ScreenSurface::new(index);
        let mut observer = DisplayObserver::new(cache.clone(), display, surface, engine.subscribe());
        observer.show();
        observer.refresh_background(&source);
        screens.push(rx);
        tokio::spawn(observer.run());
    }

    engine.show();
    engine.refresh_background();
    tokio::spawn(engine.run(inbox));

    let state = AppState {
        engine: handle,
        screens: Arc::new(screens),
    };

    let addr = format!("127.0.0.1:{}", config.port);
    tracing::info!("Starting control API on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/background/refresh", post(refresh_background))
        .route("/background/next", post(next_background))
        .route("/catalog/refresh", post(refresh_catalog))
        .route("/settings", put(update_settings))
        .route("/screens/{index}", get(get_screen))
        .route("/screens/{index}/image", get(get_screen_image))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .route("/openapi.json", get(openapi_json))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
async fn health() -> &'static str {
    "ok"
}

/// Get OpenAPI JSON specification
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Get rotation status
///
/// Current source, displayed image, persisted timestamps and armed deadlines.
#[utoipa::path(
    get,
    path = "/status",
    tag = "Background",
    responses(
        (status = 200, description = "Engine status", body = EngineStatus),
        (status = 503, description = "Engine not running")
    )
)]
async fn get_status(State(state): State<AppState>) -> Result<Json<EngineStatus>, AppError> {
    Ok(Json(state.engine.status().await?))
}

/// Reload the background from the configured source
#[utoipa::path(
    post,
    path = "/background/refresh",
    tag = "Background",
    responses((status = 202, description = "Refresh started"))
)]
async fn refresh_background(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.engine.send(Command::Refresh).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Switch to another community background now
#[utoipa::path(
    post,
    path = "/background/next",
    tag = "Background",
    responses((status = 202, description = "New rotation cycle started"))
)]
async fn next_background(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.engine.send(Command::NextImage).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Download a fresh community catalog now
#[utoipa::path(
    post,
    path = "/catalog/refresh",
    tag = "Background",
    responses((status = 202, description = "Catalog refresh started"))
)]
async fn refresh_catalog(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.engine.send(Command::FetchCatalog).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Settings the shell's settings dialog may change
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SettingsUpdate {
    /// `inbuilt:<name>`, `community` or an image file path
    source: Option<String>,
    /// Minutes between community background swaps
    wait_time: Option<u32>,
}

/// Update background settings
#[utoipa::path(
    put,
    path = "/settings",
    tag = "Background",
    request_body = SettingsUpdate,
    responses(
        (status = 202, description = "Settings applied"),
        (status = 400, description = "Empty or invalid update")
    )
)]
async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<StatusCode, AppError> {
    if update.source.is_none() && update.wait_time.is_none() {
        return Err(AppError::InvalidRequest("nothing to update".to_string()));
    }
    if update.wait_time == Some(0) {
        return Err(AppError::InvalidRequest("waitTime must be at least 1".to_string()));
    }
    if update.source.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(AppError::InvalidRequest("source must not be empty".to_string()));
    }

    if let Some(minutes) = update.wait_time {
        state.engine.send(Command::SetWaitTime(minutes)).await?;
    }
    if let Some(source) = update.source {
        state
            .engine
            .send(Command::SetSource(BackgroundSource::from(source)))
            .await?;
    }

    Ok(StatusCode::ACCEPTED)
}

/// Get what a screen shows
#[utoipa::path(
    get,
    path = "/screens/{index}",
    tag = "Screens",
    params(("index" = usize, Path, description = "Screen number, 0 is the primary screen")),
    responses(
        (status = 200, description = "Screen state", body = ScreenState),
        (status = 404, description = "No such screen")
    )
)]
async fn get_screen(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Json<ScreenState>, AppError> {
    Ok(Json(state.screen(index)?))
}

/// Get the image a screen shows
///
/// Available for community backgrounds and user image files.
#[utoipa::path(
    get,
    path = "/screens/{index}/image",
    tag = "Screens",
    params(("index" = usize, Path, description = "Screen number, 0 is the primary screen")),
    responses(
        (status = 200, description = "Image bytes", content_type = "image/*"),
        (status = 404, description = "No such screen or no image file")
    )
)]
async fn get_screen_image(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Response, AppError> {
    let path = match state.screen(index)? {
        ScreenState::Community { frame } => frame.image_path,
        ScreenState::Static { source, .. } => match BackgroundSource::from(source) {
            BackgroundSource::File(path) => path,
            other => {
                return Err(AppError::NotFound(format!("{} has no image file", other)));
            }
        },
        _ => return Err(AppError::NotFound(format!("screen {} shows no image", index))),
    };

    let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::NotFound(path.display().to_string()),
        _ => AppError::Io(e),
    })?;

    let content_type = image::guess_format(&data)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        data,
    )
        .into_response())
}
