use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

mod cleanup;
mod cookies;
mod dirs;
mod error;
mod ffmpeg;
mod pipeline;
mod provision;
mod routes;
mod spotify;
mod ytdlp;

use dirs::MediaDirs;
use error::ApiError;
use ffmpeg::Ffmpeg;
use pipeline::Pipeline;
use provision::Provisioner;
use routes::AppState;
use spotify::{SpotifyResolver, SpotifyStrategy};
use ytdlp::YtDlp;

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_COOKIE_RETENTION_SECONDS: u64 = 3600;
const CLEANUP_INTERVAL_SECONDS: u64 = 15 * 60;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_download_api=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let data_root = std::env::var("DATA_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data"));

    // Los directorios se crean una unica vez aqui; ningun request los revisita.
    let media_dirs = MediaDirs::new(&data_root);
    media_dirs.ensure_all().await?;

    let addr = resolve_bind_addr();
    let base_url = std::env::var("PUBLIC_BASE_URL")
        .ok()
        .and_then(|value| non_empty(&value).map(|value| value.trim_end_matches('/').to_string()))
        .unwrap_or_else(|| format!("http://{addr}"));

    let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);
    let cookie_retention = Duration::from_secs(
        read_u64_env("COOKIE_RETENTION_SECONDS").unwrap_or(DEFAULT_COOKIE_RETENTION_SECONDS),
    );
    let artifact_retention = read_u64_env("ARTIFACT_RETENTION_SECONDS")
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs);

    let release_url = std::env::var("YTDLP_RELEASE_URL")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| provision::DEFAULT_RELEASE_URL.to_string());
    let spotify_api_base = std::env::var("SPOTIFY_API_BASE")
        .ok()
        .and_then(|value| non_empty(&value).map(|value| value.trim_end_matches('/').to_string()))
        .unwrap_or_else(|| spotify::DEFAULT_API_BASE.to_string());
    let spotify_strategy = std::env::var("SPOTIFY_STRATEGY")
        .ok()
        .and_then(|value| SpotifyStrategy::parse(&value))
        .unwrap_or(SpotifyStrategy::RemoteApi);

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|error| ApiError::internal(format!("No se pudo crear cliente HTTP: {error}")))?;

    let provisioner = Arc::new(Provisioner::new(
        media_dirs.ytdlp_path(),
        release_url,
        http_client.clone(),
    ));
    let resolver = SpotifyResolver::new(
        http_client,
        spotify_api_base,
        spotify::DEFAULT_EMBED_BASE.to_string(),
        spotify::DEFAULT_POLL_INTERVAL,
        spotify::DEFAULT_MAX_POLL_ATTEMPTS,
    );
    let pipeline = Pipeline::new(
        media_dirs.clone(),
        base_url.clone(),
        provisioner,
        YtDlp::new(media_dirs.ytdlp_path(), ytdlp::DEFAULT_TIMEOUT),
        Ffmpeg::new(PathBuf::from("ffmpeg"), ffmpeg::DEFAULT_TIMEOUT),
        resolver,
        spotify_strategy,
        cookie_retention,
    );

    // Barrido inicial y periodico de jars huerfanos y artefactos viejos.
    cleanup::sweep_credentials(&media_dirs.tmp, cookie_retention).await;
    let _cleanup_task = cleanup::spawn_periodic(
        media_dirs.clone(),
        Duration::from_secs(CLEANUP_INTERVAL_SECONDS),
        cookie_retention,
        artifact_retention,
    );

    match spotify_strategy {
        SpotifyStrategy::RemoteApi => info!("estrategia secundaria: API remota de conversion"),
        SpotifyStrategy::Search => info!("estrategia secundaria: busqueda en plataforma primaria"),
    }

    let state = AppState {
        pipeline: Arc::new(pipeline),
        dirs: media_dirs,
        base_url,
        download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("No se pudo iniciar el puerto {addr}: {error}"))
    })?;

    info!("Backend listo en http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:3000".to_string()
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
