use std::io::ErrorKind;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::dirs::MediaDirs;
use crate::error::ApiError;
use crate::ffmpeg::AudioFormat;
use crate::pipeline::{ExtractionJob, Operation, Pipeline};

const DEFAULT_AUDIO_QUALITY_KBPS: u32 = 192;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub dirs: MediaDirs,
    pub base_url: String,
    pub download_semaphore: Arc<Semaphore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/info", get(fetch_info))
        .route("/api/download-url", get(fetch_download_url))
        .route("/api/download/video", get(download_video))
        .route("/api/download/audio", get(download_audio))
        .route("/api/convert/audio", post(convert_audio))
        .route("/api/downloads", get(list_videos))
        .route("/api/audio", get(list_audios))
        .route("/api/downloads/{filename}", delete(delete_video))
        .route("/api/audio/{filename}", delete(delete_audio))
        .route("/videos/{filename}", get(serve_video))
        .route("/audio/{filename}", get(serve_audio))
        .with_state(state)
}

fn ok(data: impl Serialize) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "data": data }))
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConvertRequest {
    filename: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

fn require_url(query: &MediaQuery) -> Result<String, ApiError> {
    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL requerida"))?;

    let valid = Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !valid {
        return Err(ApiError::bad_request("Ingresa una URL http(s) valida."));
    }

    Ok(url.to_string())
}

fn parse_audio_format(value: Option<&str>) -> Result<AudioFormat, ApiError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(AudioFormat::Mp3),
        Some(raw) => {
            AudioFormat::parse(raw).ok_or_else(|| ApiError::bad_request("Formato invalido"))
        }
    }
}

fn parse_quality(value: Option<&str>) -> Result<u32, ApiError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(DEFAULT_AUDIO_QUALITY_KBPS),
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|kbps| (8..=512).contains(kbps))
            .ok_or_else(|| ApiError::bad_request("Calidad invalida")),
    }
}

/// Los nombres llegan decodificados por el extractor de ruta: cualquier
/// separador o salto de directorio es un intento de traversal.
fn ensure_safe_filename(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ApiError::bad_request("Nombre de archivo invalido"));
    }
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "endpoints": {
            "info": "/api/info?url=VIDEO_URL",
            "downloadUrl": "/api/download-url?url=VIDEO_URL&format=FORMAT",
            "downloadVideo": "/api/download/video?url=VIDEO_URL",
            "downloadAudio": "/api/download/audio?url=VIDEO_URL&format=mp3&quality=192",
            "convertAudio": "/api/convert/audio (POST)",
            "listVideos": "/api/downloads",
            "listAudios": "/api/audio"
        }
    }))
}

async fn fetch_info(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = require_url(&query)?;
    let outcome = state
        .pipeline
        .process(ExtractionJob {
            url,
            operation: Operation::Info,
        })
        .await?;
    Ok(ok(outcome))
}

async fn fetch_download_url(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = require_url(&query)?;
    let format_selector = query
        .format
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let outcome = state
        .pipeline
        .process(ExtractionJob {
            url,
            operation: Operation::DirectUrl { format_selector },
        })
        .await?;
    Ok(ok(outcome))
}

async fn download_video(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = require_url(&query)?;
    let _permit = acquire_download_slot(&state).await?;

    let outcome = state
        .pipeline
        .process(ExtractionJob {
            url,
            operation: Operation::DownloadVideo,
        })
        .await?;
    Ok(ok(outcome))
}

async fn download_audio(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = require_url(&query)?;
    let format = parse_audio_format(query.format.as_deref())?;
    let quality_kbps = parse_quality(query.quality.as_deref())?;
    let _permit = acquire_download_slot(&state).await?;

    let outcome = state
        .pipeline
        .process(ExtractionJob {
            url,
            operation: Operation::DownloadAudio {
                format,
                quality_kbps,
            },
        })
        .await?;
    Ok(ok(outcome))
}

async fn convert_audio(
    State(state): State<AppState>,
    Json(payload): Json<ConvertRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filename = payload
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Filename requerido"))?;
    ensure_safe_filename(filename)?;

    let format = parse_audio_format(payload.format.as_deref())?;
    let quality_kbps = parse_quality(payload.quality.as_deref())?;

    let source = state.dirs.downloads.join(filename);
    if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
        return Err(ApiError::not_found("Video no encontrado"));
    }

    let _permit = acquire_download_slot(&state).await?;
    let outcome = state
        .pipeline
        .convert_existing(filename, format, quality_kbps)
        .await?;
    Ok(ok(outcome))
}

async fn acquire_download_slot(
    state: &AppState,
) -> Result<tokio::sync::OwnedSemaphorePermit, ApiError> {
    state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("No se pudo reservar capacidad de descarga."))
}

#[derive(Debug, Serialize)]
struct ListedFile {
    filename: String,
    size: u64,
    created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    url: String,
    #[serde(rename = "downloadUrl")]
    download_url: String,
}

async fn list_videos(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    list_directory(&state, state.dirs.downloads.clone(), "videos", false).await
}

async fn list_audios(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    list_directory(&state, state.dirs.audio.clone(), "audios", true).await
}

async fn list_directory(
    state: &AppState,
    dir: PathBuf,
    key: &str,
    with_format: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mount = if with_format { "audio" } else { "videos" };
    let mut files = Vec::new();

    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|error| ApiError::internal(format!("No se pudo listar archivos: {error}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| ApiError::internal(format!("No se pudo listar archivos: {error}")))?
    {
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };

        let filename = entry.file_name().to_string_lossy().to_string();
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let format = with_format.then(|| {
            FsPath::new(&filename)
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or_default()
                .to_string()
        });

        let url = format!("/{mount}/{}", urlencoding::encode(&filename));
        files.push(ListedFile {
            download_url: format!("{}{url}", state.base_url),
            filename,
            size: metadata.len(),
            created,
            format,
            url,
        });
    }

    files.sort_by(|a, b| b.created.cmp(&a.created));

    let mut data = serde_json::Map::new();
    data.insert("count".to_string(), serde_json::json!(files.len()));
    data.insert(key.to_string(), serde_json::json!(files));
    Ok(ok(serde_json::Value::Object(data)))
}

async fn delete_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_file(state.dirs.downloads.clone(), filename).await
}

async fn delete_audio(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_file(state.dirs.audio.clone(), filename).await
}

async fn delete_file(dir: PathBuf, filename: String) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_safe_filename(&filename)?;

    match tokio::fs::remove_file(dir.join(&filename)).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "success": true,
            "message": format!("{filename} eliminado")
        }))),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            Err(ApiError::not_found("Archivo no encontrado"))
        }
        Err(error) => Err(ApiError::internal(format!(
            "No se pudo eliminar el archivo: {error}"
        ))),
    }
}

async fn serve_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    serve_file(state.dirs.downloads.clone(), filename).await
}

async fn serve_audio(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    serve_file(state.dirs.audio.clone(), filename).await
}

async fn serve_file(dir: PathBuf, filename: String) -> Result<Response, ApiError> {
    ensure_safe_filename(&filename)?;
    let path = dir.join(&filename);

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("Archivo no encontrado"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "No se pudo abrir el archivo: {error}"
            )));
        }
    };

    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("No se pudo leer metadata: {error}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("No se pudo crear el tamano de descarga."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
