use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    http::{HeaderValue, header},
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use rodnya_api::AppState;
use rodnya_api::upload::MAX_UPLOAD_BYTES;
use rodnya_gateway::dispatcher::Dispatcher;
use rodnya_gateway::push::PushClient;
use rodnya_gateway::{GatewayState, SharedState, connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rodnya=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("RODNYA_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("RODNYA_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let db_path = std::env::var("RODNYA_DB_PATH").unwrap_or_else(|_| "rodnya.db".into());
    let upload_dir: PathBuf = std::env::var("RODNYA_UPLOAD_DIR")
        .unwrap_or_else(|_| "./uploads".into())
        .into();
    let public_dir: PathBuf = std::env::var("RODNYA_PUBLIC_DIR")
        .unwrap_or_else(|_| "./public".into())
        .into();

    // Init database and upload storage
    let db = Arc::new(rodnya_db::Database::open(&PathBuf::from(&db_path))?);
    tokio::fs::create_dir_all(&upload_dir).await?;
    info!("Upload directory: {}", upload_dir.display());

    // Shared state
    let dispatcher = Dispatcher::new();
    let gateway_state: SharedState = Arc::new(GatewayState {
        db,
        dispatcher,
        push: PushClient::new(),
    });
    let api_state = AppState { upload_dir };

    // Routes
    let http_routes = Router::new()
        .route("/ping", get(ping))
        .route("/upload", post(rodnya_api::upload::upload))
        .route("/uploads/{filename}", get(rodnya_api::files::serve_upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(api_state);

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_route)
        .fallback_service(ServeDir::new(&public_dir))
        // HTTP caching is disabled wholesale; the frontend caches via its
        // service worker instead
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate, proxy-revalidate"),
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Rodnya server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn ws_upgrade(State(state): State<SharedState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
