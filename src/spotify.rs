use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::ytdlp::MediaInfo;

pub const DEFAULT_API_BASE: &str = "https://api.fabdl.com";
pub const DEFAULT_EMBED_BASE: &str = "https://open.spotify.com/embed/track";
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

const META_TIMEOUT: Duration = Duration::from_secs(15);

/// Estado terminal de exito que reporta el endpoint de progreso.
const STATUS_COMPLETED: i64 = 3;

/// Estrategia para URLs de la plataforma secundaria. Se fija una vez por
/// proceso; nunca se mezclan dentro de un mismo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotifyStrategy {
    RemoteApi,
    Search,
}

impl SpotifyStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "remote-api" => Some(Self::RemoteApi),
            "search" => Some(Self::Search),
            _ => None,
        }
    }
}

pub fn is_secondary_url(input: &str) -> bool {
    url::Url::parse(input)
        .ok()
        .and_then(|parsed| {
            parsed.host_str().map(|host| {
                let host = host.to_ascii_lowercase();
                host == "open.spotify.com" || host.ends_with(".spotify.com")
            })
        })
        .unwrap_or(false)
}

/// Metadatos del track segun la API remota de conversion.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    pub title: String,
    pub artists: Option<String>,
    pub album: Option<String>,
    pub duration_ms: u64,
    pub image: Option<String>,
    pub gid: i64,
    pub id: String,
}

impl TrackMeta {
    pub fn to_media_info(&self, requested_url: &str) -> MediaInfo {
        MediaInfo {
            title: if self.title.trim().is_empty() {
                "Sin título".to_string()
            } else {
                self.title.clone()
            },
            duration: self.duration_ms / 1000,
            resolution: "N/A".to_string(),
            thumbnail: self.image.clone(),
            uploader: self.artists.clone(),
            upload_date: None,
            view_count: None,
            description: self.album.clone(),
            id: Some(self.id.clone()),
            url: requested_url.to_string(),
            duration_text: Some(format_duration(self.duration_ms)),
            formats: Vec::new(),
        }
    }
}

/// Duracion como `minutos:segundos` con los segundos a dos digitos.
pub fn format_duration(ms: u64) -> String {
    let total_seconds = ms / 1000;
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}

#[derive(Debug, Deserialize)]
struct MetaEnvelope {
    result: Option<MetaPayload>,
}

#[derive(Debug, Deserialize)]
struct MetaPayload {
    gid: i64,
    id: String,
    name: String,
    artists: Option<String>,
    album: Option<String>,
    duration_ms: Option<u64>,
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    result: Option<TaskPayload>,
}

#[derive(Debug, Deserialize)]
struct TaskPayload {
    tid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProgressEnvelope {
    result: Option<ProgressPayload>,
}

#[derive(Debug, Deserialize)]
struct ProgressPayload {
    status: i64,
    download_url: Option<String>,
}

/// Titulo y artista raspados de la pagina de embed (ruta de busqueda).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedTrack {
    pub title: String,
    pub artist: String,
}

static OG_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta\s+property="og:title"\s+content="([^"]+)""#).expect("regex og:title")
});
static OG_DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta\s+property="og:description"\s+content="([^"]+)""#)
        .expect("regex og:description")
});
static TITLE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<title>([^<]+)</title>").expect("regex title"));

#[derive(Debug, Clone)]
pub struct SpotifyResolver {
    client: reqwest::Client,
    api_base: String,
    embed_base: String,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl SpotifyResolver {
    pub fn new(
        client: reqwest::Client,
        api_base: String,
        embed_base: String,
        poll_interval: Duration,
        max_poll_attempts: u32,
    ) -> Self {
        Self {
            client,
            api_base,
            embed_base,
            poll_interval,
            max_poll_attempts,
        }
    }

    pub async fn fetch_track_meta(&self, track_url: &str) -> Result<TrackMeta, CoreError> {
        let endpoint = format!(
            "{}/spotify/get?url={}",
            self.api_base,
            urlencoding::encode(track_url)
        );

        let envelope: MetaEnvelope = self
            .client
            .get(&endpoint)
            .timeout(META_TIMEOUT)
            .send()
            .await
            .map_err(|error| CoreError::MetadataFetch {
                url: track_url.to_string(),
                message: error.to_string(),
            })?
            .json()
            .await
            .map_err(|error| CoreError::MetadataFetch {
                url: track_url.to_string(),
                message: error.to_string(),
            })?;

        let payload = envelope.result.ok_or_else(|| CoreError::MetadataFetch {
            url: track_url.to_string(),
            message: "la respuesta no trae payload de resultado".to_string(),
        })?;

        Ok(TrackMeta {
            title: payload.name,
            artists: payload.artists,
            album: payload.album,
            duration_ms: payload.duration_ms.unwrap_or(0),
            image: payload.image,
            gid: payload.gid,
            id: payload.id,
        })
    }

    pub async fn request_conversion(&self, gid: i64, id: &str) -> Result<i64, CoreError> {
        let endpoint = format!("{}/spotify/mp3-convert-task/{gid}/{id}", self.api_base);

        let envelope: TaskEnvelope = self
            .client
            .get(&endpoint)
            .timeout(META_TIMEOUT)
            .send()
            .await
            .map_err(|error| CoreError::ConversionRequest {
                message: error.to_string(),
            })?
            .json()
            .await
            .map_err(|error| CoreError::ConversionRequest {
                message: error.to_string(),
            })?;

        envelope
            .result
            .and_then(|payload| payload.tid)
            .ok_or_else(|| CoreError::ConversionRequest {
                message: "la respuesta no trae identificador de seguimiento".to_string(),
            })
    }

    /// Sondea el progreso a intervalo fijo. Un estado terminal de fallo corta
    /// de inmediato sin consumir el resto del presupuesto; los errores HTTP
    /// transitorios consumen un intento en lugar de abortar.
    pub async fn poll_conversion(&self, tid: i64) -> Result<String, CoreError> {
        let endpoint = format!("{}/spotify/mp3-convert-progress/{tid}", self.api_base);

        for attempt in 1..=self.max_poll_attempts {
            let progress = self.fetch_progress(&endpoint).await;

            match progress {
                Ok(Some(payload)) => {
                    if payload.status == STATUS_COMPLETED {
                        if let Some(download_url) = payload.download_url {
                            return Ok(self.absolute_download_url(&download_url));
                        }
                        return Err(CoreError::ConversionRequest {
                            message: "estado completado sin URL de descarga".to_string(),
                        });
                    }
                    if payload.status < 0 {
                        return Err(CoreError::ConversionFailed {
                            status: payload.status,
                        });
                    }
                    debug!("conversion {tid} en progreso (estado {})", payload.status);
                }
                Ok(None) => debug!("conversion {tid} sin payload todavia"),
                Err(error) => warn!("error transitorio sondeando {tid}: {error}"),
            }

            if attempt < self.max_poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(CoreError::ConversionTimeout {
            attempts: self.max_poll_attempts,
        })
    }

    async fn fetch_progress(&self, endpoint: &str) -> Result<Option<ProgressPayload>, String> {
        let response = self
            .client
            .get(endpoint)
            .timeout(META_TIMEOUT)
            .send()
            .await
            .map_err(|error| error.to_string())?;

        let envelope: ProgressEnvelope =
            response.json().await.map_err(|error| error.to_string())?;
        Ok(envelope.result)
    }

    fn absolute_download_url(&self, download_url: &str) -> String {
        if download_url.starts_with("http") {
            download_url.to_string()
        } else {
            format!("{}{download_url}", self.api_base)
        }
    }

    /// Materializa el archivo convertido por streaming.
    pub async fn fetch_audio_file(&self, url: &str, destination: &Path) -> Result<u64, CoreError> {
        let wrap = |message: String| CoreError::ConversionRequest {
            message: format!("no se pudo descargar el audio convertido: {message}"),
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| wrap(error.to_string()))?;
        if !response.status().is_success() {
            return Err(wrap(format!("estado HTTP {}", response.status())));
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|error| wrap(error.to_string()))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| wrap(error.to_string()))?;
            written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|error| wrap(error.to_string()))?;
        }
        file.flush().await.map_err(|error| wrap(error.to_string()))?;

        Ok(written)
    }

    /// Extraccion best-effort de titulo/artista desde la pagina publica de
    /// embed: primero los meta tags, si faltan se parte el `<title>` por su
    /// separador.
    pub async fn scrape_embed_meta(&self, track_url: &str) -> Result<ScrapedTrack, CoreError> {
        let track_id = url::Url::parse(track_url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|segments| segments.last().map(|segment| segment.to_string()))
            })
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| CoreError::MetadataFetch {
                url: track_url.to_string(),
                message: "la URL no contiene identificador de track".to_string(),
            })?;

        let embed_url = format!("{}/{track_id}", self.embed_base);
        let page = self
            .client
            .get(&embed_url)
            .timeout(META_TIMEOUT)
            .send()
            .await
            .map_err(|error| CoreError::MetadataFetch {
                url: track_url.to_string(),
                message: error.to_string(),
            })?
            .text()
            .await
            .map_err(|error| CoreError::MetadataFetch {
                url: track_url.to_string(),
                message: error.to_string(),
            })?;

        if let Some(title) = first_capture(&OG_TITLE_RE, &page) {
            let artist = first_capture(&OG_DESCRIPTION_RE, &page)
                .and_then(|description| {
                    description
                        .split('·')
                        .next()
                        .map(|artist| artist.trim().to_string())
                })
                .unwrap_or_default();
            return Ok(ScrapedTrack { title, artist });
        }

        if let Some(combined) = first_capture(&TITLE_TAG_RE, &page) {
            let combined = combined.split('|').next().unwrap_or(&combined).trim();
            if let Some((title, artist)) = combined.split_once(" - ") {
                return Ok(ScrapedTrack {
                    title: title.trim().to_string(),
                    artist: artist.trim().to_string(),
                });
            }
            if !combined.is_empty() {
                return Ok(ScrapedTrack {
                    title: combined.to_string(),
                    artist: String::new(),
                });
            }
        }

        Err(CoreError::MetadataFetch {
            url: track_url.to_string(),
            message: "la pagina de embed no expone metadatos".to_string(),
        })
    }
}

fn first_capture(regex: &Regex, haystack: &str) -> Option<String> {
    regex
        .captures(haystack)
        .and_then(|captures| captures.get(1))
        .map(|capture| capture.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}
