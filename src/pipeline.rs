use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::cleanup;
use crate::cookies::{CookieFactory, CookieJar};
use crate::dirs::MediaDirs;
use crate::error::CoreError;
use crate::ffmpeg::{AudioFormat, Ffmpeg};
use crate::provision::Provisioner;
use crate::spotify::{self, SpotifyResolver, SpotifyStrategy};
use crate::ytdlp::{DEFAULT_FORMAT_SELECTOR, MediaInfo, YtDlp, sanitize_title};

/// Operacion solicitada para un job de extraccion.
#[derive(Debug, Clone)]
pub enum Operation {
    Info,
    DirectUrl { format_selector: Option<String> },
    DownloadVideo,
    DownloadAudio { format: AudioFormat, quality_kbps: u32 },
}

/// Un job por request: se crea al entrar y se descarta al responder.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub url: String,
    pub operation: Operation,
}

/// Archivo materializado y sus URLs de servicio.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub filename: String,
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    pub url: String,
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
}

#[derive(Debug, Serialize)]
pub struct JobOutcome {
    #[serde(flatten)]
    pub info: MediaInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Artifact>,
    #[serde(rename = "downloadUrl", skip_serializing_if = "Option::is_none")]
    pub direct_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl JobOutcome {
    fn info_only(info: MediaInfo) -> Self {
        Self {
            info,
            download: None,
            audio: None,
            direct_url: None,
            format: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConvertOutcome {
    #[serde(rename = "originalVideo")]
    pub original_video: String,
    pub audio: Artifact,
}

/// Secuencia las etapas por request: aprovisionamiento, contexto de cookies,
/// extraccion, transcodificacion opcional y liberacion del contexto en todo
/// camino de salida.
pub struct Pipeline {
    dirs: MediaDirs,
    base_url: String,
    provisioner: Arc<Provisioner>,
    cookies: CookieFactory,
    ytdlp: YtDlp,
    ffmpeg: Ffmpeg,
    spotify: SpotifyResolver,
    strategy: SpotifyStrategy,
    cookie_retention: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dirs: MediaDirs,
        base_url: String,
        provisioner: Arc<Provisioner>,
        ytdlp: YtDlp,
        ffmpeg: Ffmpeg,
        spotify: SpotifyResolver,
        strategy: SpotifyStrategy,
        cookie_retention: Duration,
    ) -> Self {
        let cookies = CookieFactory::new(dirs.tmp.clone());
        Self {
            dirs,
            base_url,
            provisioner,
            cookies,
            ytdlp,
            ffmpeg,
            spotify,
            strategy,
            cookie_retention,
        }
    }

    pub async fn process(&self, job: ExtractionJob) -> Result<JobOutcome, CoreError> {
        if spotify::is_secondary_url(&job.url) {
            match self.strategy {
                SpotifyStrategy::RemoteApi => self.process_secondary_remote(job).await,
                SpotifyStrategy::Search => {
                    let rewritten = self.rewrite_via_search(job).await?;
                    self.process_primary(rewritten).await
                }
            }
        } else {
            self.process_primary(job).await
        }
    }

    /// Transcodifica un video ya materializado; no toca el extractor.
    pub async fn convert_existing(
        &self,
        filename: &str,
        format: AudioFormat,
        quality_kbps: u32,
    ) -> Result<ConvertOutcome, CoreError> {
        let source = self.dirs.downloads.join(filename);
        let converted = self
            .ffmpeg
            .convert(&source, &self.dirs.audio, format, quality_kbps)
            .await?;
        let audio = self
            .artifact_from(&converted, "audio", Some(format), Some(quality_kbps))
            .await?;

        Ok(ConvertOutcome {
            original_video: filename.to_string(),
            audio,
        })
    }

    async fn process_primary(&self, job: ExtractionJob) -> Result<JobOutcome, CoreError> {
        self.provisioner.ensure().await?;
        cleanup::sweep_credentials(&self.dirs.tmp, self.cookie_retention).await;

        let jar = self.cookies.create().await?;
        // Las etapas corren en un futuro interior cuyo resultado se captura
        // antes de liberar el jar: la liberacion es incondicional.
        let result = self.run_stages(&job, &jar).await;
        self.cookies.destroy(&jar).await;
        result
    }

    async fn run_stages(
        &self,
        job: &ExtractionJob,
        jar: &CookieJar,
    ) -> Result<JobOutcome, CoreError> {
        let info = self.ytdlp.fetch_info(&job.url, jar).await?;

        match &job.operation {
            Operation::Info => Ok(JobOutcome::info_only(info)),

            Operation::DirectUrl { format_selector } => {
                let selector = format_selector.as_deref().unwrap_or(DEFAULT_FORMAT_SELECTOR);
                let direct_url = self.ytdlp.resolve_url(&job.url, jar, selector).await?;
                Ok(JobOutcome {
                    direct_url: Some(direct_url),
                    format: Some(selector.to_string()),
                    ..JobOutcome::info_only(info)
                })
            }

            Operation::DownloadVideo => {
                let path = self
                    .ytdlp
                    .download_video(&job.url, jar, &info, &self.dirs.downloads)
                    .await?;
                info!("video materializado: {:?}", path.file_name());
                let download = self.artifact_from(&path, "videos", None, None).await?;
                Ok(JobOutcome {
                    download: Some(download),
                    ..JobOutcome::info_only(info)
                })
            }

            Operation::DownloadAudio {
                format,
                quality_kbps,
            } => {
                let path = self
                    .ytdlp
                    .download_audio(&job.url, jar, &info, &self.dirs.audio, *format, *quality_kbps)
                    .await?;
                let audio = self
                    .artifact_from(&path, "audio", Some(*format), Some(*quality_kbps))
                    .await?;
                Ok(JobOutcome {
                    audio: Some(audio),
                    ..JobOutcome::info_only(info)
                })
            }
        }
    }

    async fn process_secondary_remote(&self, job: ExtractionJob) -> Result<JobOutcome, CoreError> {
        let meta = self.spotify.fetch_track_meta(&job.url).await?;
        let info = meta.to_media_info(&job.url);

        match &job.operation {
            Operation::Info => Ok(JobOutcome::info_only(info)),

            Operation::DirectUrl { .. } => {
                let tid = self.spotify.request_conversion(meta.gid, &meta.id).await?;
                let download_url = self.spotify.poll_conversion(tid).await?;
                Ok(JobOutcome {
                    direct_url: Some(download_url),
                    format: Some(AudioFormat::Mp3.as_str().to_string()),
                    ..JobOutcome::info_only(info)
                })
            }

            Operation::DownloadVideo => Err(CoreError::Extraction {
                operation: "download-video",
                url: job.url.clone(),
                message: "la plataforma secundaria solo ofrece audio".to_string(),
            }),

            Operation::DownloadAudio {
                format,
                quality_kbps,
            } => {
                let tid = self.spotify.request_conversion(meta.gid, &meta.id).await?;
                let remote_url = self.spotify.poll_conversion(tid).await?;

                let display = match &meta.artists {
                    Some(artists) => format!("{artists} - {}", meta.title),
                    None => meta.title.clone(),
                };
                let filename = format!("{}_{}.mp3", sanitize_title(&display), meta.id);
                let destination = self.dirs.audio.join(&filename);
                self.spotify.fetch_audio_file(&remote_url, &destination).await?;

                // La API remota siempre entrega mp3; otros contenedores salen
                // de una pasada extra por el transcodificador.
                let final_path = if *format == AudioFormat::Mp3 {
                    destination
                } else {
                    self.ffmpeg
                        .convert(&destination, &self.dirs.audio, *format, *quality_kbps)
                        .await?
                };

                let audio = self
                    .artifact_from(&final_path, "audio", Some(*format), Some(*quality_kbps))
                    .await?;
                Ok(JobOutcome {
                    audio: Some(audio),
                    ..JobOutcome::info_only(info)
                })
            }
        }
    }

    /// Estrategia alternativa: raspar el embed, buscar en la plataforma
    /// primaria y reescribir el job hacia la mejor coincidencia.
    async fn rewrite_via_search(&self, job: ExtractionJob) -> Result<ExtractionJob, CoreError> {
        let scraped = self.spotify.scrape_embed_meta(&job.url).await?;
        let query = if scraped.artist.is_empty() {
            scraped.title.clone()
        } else {
            format!("{} {}", scraped.artist, scraped.title)
        };

        self.provisioner.ensure().await?;
        let jar = self.cookies.create().await?;
        let result = self.ytdlp.search_first(&query, &jar).await;
        self.cookies.destroy(&jar).await;

        let matched = result?;
        if matched.url.is_empty() {
            return Err(CoreError::SearchNoResults { query });
        }

        info!("track secundario reescrito hacia {}", matched.url);
        Ok(ExtractionJob {
            url: matched.url,
            operation: job.operation,
        })
    }

    async fn artifact_from(
        &self,
        path: &Path,
        mount: &str,
        format: Option<AudioFormat>,
        quality_kbps: Option<u32>,
    ) -> Result<Artifact, CoreError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("download.bin")
            .to_string();

        let metadata =
            tokio::fs::metadata(path)
                .await
                .map_err(|_| CoreError::ArtifactNotFound {
                    title: filename.clone(),
                })?;

        let url = format!("/{mount}/{}", urlencoding::encode(&filename));
        Ok(Artifact {
            filename,
            path: path.display().to_string(),
            size: metadata.len(),
            format: format.map(|value| value.as_str().to_string()),
            quality: quality_kbps.map(|value| value.to_string()),
            download_url: format!("{}{url}", self.base_url),
            url,
        })
    }
}
