use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::cookies::CookieJar;
use crate::error::CoreError;
use crate::ffmpeg::AudioFormat;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const REFERER: &str = "https://www.youtube.com/";
pub const DEFAULT_FORMAT_SELECTOR: &str = "best[ext=mp4]/best";
const MAX_FORMATS: usize = 10;
const MAX_TITLE_CHARS: usize = 100;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Metadatos canonicos: todos los campos tienen un valor de reserva definido,
/// la forma nunca tiene miembros ausentes.
#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub title: String,
    pub duration: u64,
    pub resolution: String,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    #[serde(rename = "uploadDate")]
    pub upload_date: Option<String>,
    #[serde(rename = "viewCount")]
    pub view_count: Option<u64>,
    pub description: Option<String>,
    pub id: Option<String>,
    pub url: String,
    #[serde(rename = "durationText", skip_serializing_if = "Option::is_none")]
    pub duration_text: Option<String>,
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: Option<String>,
    pub quality: Option<serde_json::Value>,
    pub filesize: Option<u64>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    resolution: Option<String>,
    height: Option<u32>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    upload_date: Option<String>,
    view_count: Option<u64>,
    description: Option<String>,
    id: Option<String>,
    webpage_url: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    quality: Option<serde_json::Value>,
    filesize: Option<f64>,
    url: Option<String>,
}

impl RawInfo {
    fn normalize(self, requested_url: &str) -> MediaInfo {
        let resolution = self
            .resolution
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.height.map(|height| format!("{height}p")))
            .unwrap_or_else(|| "N/A".to_string());

        MediaInfo {
            title: self
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Sin título".to_string()),
            duration: self.duration.map(|value| value.round() as u64).unwrap_or(0),
            resolution,
            thumbnail: self.thumbnail,
            uploader: self.uploader,
            upload_date: self.upload_date,
            view_count: self.view_count,
            description: self.description,
            id: self.id,
            url: self
                .webpage_url
                .unwrap_or_else(|| requested_url.to_string()),
            duration_text: None,
            formats: self
                .formats
                .into_iter()
                .take(MAX_FORMATS)
                .map(|format| FormatInfo {
                    format_id: format.format_id.unwrap_or_default(),
                    ext: format.ext,
                    quality: format.quality,
                    filesize: format.filesize.map(|size| size as u64),
                    url: format.url,
                })
                .collect(),
        }
    }
}

/// Quita los caracteres inseguros para nombres de archivo y colapsa los
/// espacios en guiones bajos, recortando a una longitud fija.
pub fn sanitize_title(title: &str) -> String {
    let stripped: String = title
        .chars()
        .filter(|character| !matches!(character, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();

    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect()
}

/// Raiz de nombre unica: titulo saneado mas el identificador estable, o los
/// milisegundos actuales cuando la fuente no da identificador.
pub fn unique_stem(info: &MediaInfo) -> String {
    let suffix = info
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Utc::now().timestamp_millis().to_string());
    format!("{}_{}", sanitize_title(&info.title), suffix)
}

/// Cliente del binario de extraccion. No reintenta fallos transitorios: esa
/// decision pertenece al pipeline.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    fn base_args(&self, jar: &CookieJar) -> Vec<String> {
        vec![
            "--user-agent".to_string(),
            USER_AGENT.to_string(),
            "--referer".to_string(),
            REFERER.to_string(),
            "--cookies".to_string(),
            jar.path().to_string_lossy().to_string(),
        ]
    }

    async fn run(
        &self,
        operation: &'static str,
        url: &str,
        args: Vec<String>,
    ) -> Result<std::process::Output, CoreError> {
        let command_future = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| CoreError::Cancelled { operation })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    CoreError::Provisioning(
                        "el binario de extraccion no esta disponible en el sistema".to_string(),
                    )
                } else {
                    CoreError::Extraction {
                        operation,
                        url: url.to_string(),
                        message: error.to_string(),
                    }
                }
            })?;

        // El binario escribe diagnosticos por stderr sin que eso sea un error;
        // solo un codigo de salida distinto de cero es fatal.
        if !output.stderr.is_empty() {
            warn!(
                "diagnostico del extractor ({operation}): {}",
                last_line(&output.stderr)
            );
        }

        if !output.status.success() {
            return Err(CoreError::Extraction {
                operation,
                url: url.to_string(),
                message: last_line(&output.stderr),
            });
        }

        Ok(output)
    }

    pub async fn fetch_info(&self, url: &str, jar: &CookieJar) -> Result<MediaInfo, CoreError> {
        let mut args = self.base_args(jar);
        args.extend([
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ]);

        let output = self.run("info", url, args).await?;
        let raw: RawInfo =
            serde_json::from_slice(&output.stdout).map_err(|error| CoreError::MetadataParse {
                url: url.to_string(),
                message: error.to_string(),
            })?;

        Ok(raw.normalize(url))
    }

    /// Resuelve (sin descargar) la mejor coincidencia del selector y devuelve
    /// la URL impresa, que debe ser http(s) absoluta.
    pub async fn resolve_url(
        &self,
        url: &str,
        jar: &CookieJar,
        format_selector: &str,
    ) -> Result<String, CoreError> {
        let mut args = self.base_args(jar);
        args.extend([
            "--format".to_string(),
            format_selector.to_string(),
            "--get-url".to_string(),
            url.to_string(),
        ]);

        let output = self.run("direct-url", url, args).await?;
        let resolved = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let valid = url::Url::parse(&resolved)
            .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
            .unwrap_or(false);
        if resolved.is_empty() || !valid {
            return Err(CoreError::Resolution {
                url: url.to_string(),
                output: resolved,
            });
        }

        Ok(resolved)
    }

    /// Materializa el video bajo `downloads_dir`. El binario decide la
    /// extension final, asi que el archivo se reconcilia despues buscando un
    /// nombre que contenga el titulo saneado o el identificador.
    pub async fn download_video(
        &self,
        url: &str,
        jar: &CookieJar,
        info: &MediaInfo,
        downloads_dir: &Path,
    ) -> Result<PathBuf, CoreError> {
        let stem = unique_stem(info);
        let template = downloads_dir.join(format!("{stem}.%(ext)s"));

        let mut args = self.base_args(jar);
        args.extend([
            "--format".to_string(),
            DEFAULT_FORMAT_SELECTOR.to_string(),
            "--no-playlist".to_string(),
            "--output".to_string(),
            template.to_string_lossy().to_string(),
            url.to_string(),
        ]);

        self.run("download-video", url, args).await?;
        self.locate_artifact(downloads_dir, info).await
    }

    /// Extrae el audio directamente a un nombre de archivo determinado.
    pub async fn download_audio(
        &self,
        url: &str,
        jar: &CookieJar,
        info: &MediaInfo,
        audio_dir: &Path,
        format: AudioFormat,
        quality_kbps: u32,
    ) -> Result<PathBuf, CoreError> {
        let filename = format!("{}.{}", unique_stem(info), format.as_str());
        let destination = audio_dir.join(&filename);

        let mut args = self.base_args(jar);
        args.extend([
            "--extract-audio".to_string(),
            "--audio-format".to_string(),
            format.as_str().to_string(),
            "--audio-quality".to_string(),
            quality_kbps.to_string(),
            "--no-playlist".to_string(),
            "--output".to_string(),
            destination.to_string_lossy().to_string(),
            url.to_string(),
        ]);

        self.run("download-audio", url, args).await?;

        if !tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            return Err(CoreError::ArtifactNotFound {
                title: sanitize_title(&info.title),
            });
        }

        Ok(destination)
    }

    /// Busqueda en la plataforma primaria: primer resultado de `ytsearch1:`.
    pub async fn search_first(
        &self,
        query: &str,
        jar: &CookieJar,
    ) -> Result<MediaInfo, CoreError> {
        let target = format!("ytsearch1:{query}");
        let mut args = self.base_args(jar);
        args.extend([
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            target.clone(),
        ]);

        let output = self.run("search", &target, args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().find(|line| !line.trim().is_empty());

        let Some(line) = first_line else {
            return Err(CoreError::SearchNoResults {
                query: query.to_string(),
            });
        };

        let raw: RawInfo = serde_json::from_str(line).map_err(|_| CoreError::SearchNoResults {
            query: query.to_string(),
        })?;

        if raw.webpage_url.is_none() && raw.id.is_none() {
            return Err(CoreError::SearchNoResults {
                query: query.to_string(),
            });
        }

        Ok(raw.normalize(""))
    }

    async fn locate_artifact(
        &self,
        directory: &Path,
        info: &MediaInfo,
    ) -> Result<PathBuf, CoreError> {
        let safe_title = sanitize_title(&info.title);

        let mut entries =
            tokio::fs::read_dir(directory)
                .await
                .map_err(|error| CoreError::Extraction {
                    operation: "download-video",
                    url: info.url.clone(),
                    message: error.to_string(),
                })?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let matches_title = !safe_title.is_empty() && name.contains(&safe_title);
            let matches_id = info
                .id
                .as_deref()
                .is_some_and(|id| !id.is_empty() && name.contains(id));
            if matches_title || matches_id {
                return Ok(entry.path());
            }
        }

        Err(CoreError::ArtifactNotFound { title: safe_title })
    }
}

fn last_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("el extractor no pudo completar la operacion")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_unsafe_characters_and_whitespace() {
        let dirty = "  Mi <video>: \"uno/dos\\tres|cuatro?*\"   con   espacios  ";
        let clean = sanitize_title(dirty);

        for forbidden in ['<', '>', ':', '"', '/', '\\', '|', '?', '*', ' '] {
            assert!(!clean.contains(forbidden), "contiene {forbidden:?}: {clean}");
        }
        assert_eq!(clean, "Mi_video_unodostrescuatro_con_espacios");
    }

    #[test]
    fn sanitize_truncates_to_maximum_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_title(&long).chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn normalize_applies_documented_defaults() {
        let raw: RawInfo = serde_json::from_value(json!({})).expect("raw vacio");
        let info = raw.normalize("https://example.com/v");

        assert_eq!(info.title, "Sin título");
        assert_eq!(info.duration, 0);
        assert_eq!(info.resolution, "N/A");
        assert_eq!(info.url, "https://example.com/v");
        assert!(info.thumbnail.is_none());
        assert!(info.formats.is_empty());
    }

    #[test]
    fn normalize_derives_resolution_from_height() {
        let raw: RawInfo = serde_json::from_value(json!({ "height": 720 })).expect("raw");
        assert_eq!(raw.normalize("u").resolution, "720p");
    }

    #[test]
    fn normalize_caps_format_list() {
        let formats: Vec<_> = (0..25)
            .map(|index| json!({ "format_id": index.to_string(), "ext": "mp4" }))
            .collect();
        let raw: RawInfo =
            serde_json::from_value(json!({ "formats": formats })).expect("raw");
        assert_eq!(raw.normalize("u").formats.len(), MAX_FORMATS);
    }

    #[test]
    fn unique_stem_falls_back_to_timestamp() {
        let raw: RawInfo = serde_json::from_value(json!({ "title": "Tema" })).expect("raw");
        let info = raw.normalize("u");
        let stem = unique_stem(&info);
        assert!(stem.starts_with("Tema_"));
        assert!(stem.len() > "Tema_".len());
    }

    #[cfg(unix)]
    mod with_fake_binary {
        use super::*;
        use crate::cookies::CookieFactory;

        async fn fake_binary(dir: &Path, body: &str) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let path = dir.join("yt-dlp");
            tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
                .await
                .expect("script");
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .expect("chmod");
            path
        }

        async fn jar(dir: &Path) -> CookieJar {
            CookieFactory::new(dir.to_path_buf())
                .create()
                .await
                .expect("jar")
        }

        #[tokio::test]
        async fn fetch_info_parses_and_normalizes() {
            let dir = tempfile::tempdir().expect("tempdir");
            let binary = fake_binary(
                dir.path(),
                r#"echo 'advertencia' >&2
echo '{"title":"Song","duration":180,"id":"abc"}'"#,
            )
            .await;
            let jar = jar(dir.path()).await;

            let client = YtDlp::new(binary, DEFAULT_TIMEOUT);
            let info = client
                .fetch_info("https://example.com/v", &jar)
                .await
                .expect("info");

            assert_eq!(info.title, "Song");
            assert_eq!(info.duration, 180);
            assert_eq!(info.id.as_deref(), Some("abc"));
            assert_eq!(info.resolution, "N/A");
            assert!(info.formats.is_empty());
        }

        #[tokio::test]
        async fn fetch_info_fails_on_unparsable_output() {
            let dir = tempfile::tempdir().expect("tempdir");
            let binary = fake_binary(dir.path(), "echo 'esto no es json'").await;
            let jar = jar(dir.path()).await;

            let error = YtDlp::new(binary, DEFAULT_TIMEOUT)
                .fetch_info("https://example.com/v", &jar)
                .await
                .expect_err("debe fallar");
            assert!(matches!(error, CoreError::MetadataParse { .. }));
        }

        #[tokio::test]
        async fn nonzero_exit_is_an_extraction_error() {
            let dir = tempfile::tempdir().expect("tempdir");
            let binary = fake_binary(dir.path(), "echo 'video no disponible' >&2\nexit 1").await;
            let jar = jar(dir.path()).await;

            let error = YtDlp::new(binary, DEFAULT_TIMEOUT)
                .fetch_info("https://example.com/v", &jar)
                .await
                .expect_err("debe fallar");
            match error {
                CoreError::Extraction { message, .. } => {
                    assert!(message.contains("video no disponible"))
                }
                other => panic!("variante inesperada: {other:?}"),
            }
        }

        #[tokio::test]
        async fn missing_binary_is_a_provisioning_error() {
            let dir = tempfile::tempdir().expect("tempdir");
            let jar = jar(dir.path()).await;

            let client = YtDlp::new(dir.path().join("no-existe"), DEFAULT_TIMEOUT);
            let error = client
                .fetch_info("https://example.com/v", &jar)
                .await
                .expect_err("debe fallar");
            assert!(matches!(error, CoreError::Provisioning(_)));
        }

        #[tokio::test]
        async fn resolve_url_accepts_absolute_http() {
            let dir = tempfile::tempdir().expect("tempdir");
            let binary =
                fake_binary(dir.path(), "echo 'https://cdn.example.com/v.mp4'").await;
            let jar = jar(dir.path()).await;

            let resolved = YtDlp::new(binary, DEFAULT_TIMEOUT)
                .resolve_url("https://example.com/v", &jar, "best")
                .await
                .expect("url");
            assert_eq!(resolved, "https://cdn.example.com/v.mp4");
        }

        #[tokio::test]
        async fn resolve_url_rejects_relative_or_empty_output() {
            let dir = tempfile::tempdir().expect("tempdir");
            let jar = jar(dir.path()).await;

            for body in ["echo '/ruta/relativa.mp4'", "echo ''"] {
                let binary = fake_binary(dir.path(), body).await;
                let error = YtDlp::new(binary, DEFAULT_TIMEOUT)
                    .resolve_url("https://example.com/v", &jar, "best")
                    .await
                    .expect_err("debe fallar");
                assert!(matches!(error, CoreError::Resolution { .. }));
            }
        }

        #[tokio::test]
        async fn download_video_reconciles_real_extension() {
            let dir = tempfile::tempdir().expect("tempdir");
            let downloads = dir.path().join("downloads");
            tokio::fs::create_dir_all(&downloads).await.expect("dir");

            // El binario "descarga" sustituyendo la extension del template.
            let binary = fake_binary(
                dir.path(),
                &format!("touch '{}/Song_abc.webm'", downloads.display()),
            )
            .await;
            let jar = jar(dir.path()).await;

            let raw: RawInfo =
                serde_json::from_value(json!({ "title": "Song", "id": "abc" })).expect("raw");
            let info = raw.normalize("https://example.com/v");

            let path = YtDlp::new(binary, DEFAULT_TIMEOUT)
                .download_video("https://example.com/v", &jar, &info, &downloads)
                .await
                .expect("descarga");
            assert!(path.to_string_lossy().ends_with("Song_abc.webm"));
        }

        #[tokio::test]
        async fn download_video_without_artifact_fails() {
            let dir = tempfile::tempdir().expect("tempdir");
            let downloads = dir.path().join("downloads");
            tokio::fs::create_dir_all(&downloads).await.expect("dir");

            let binary = fake_binary(dir.path(), "true").await;
            let jar = jar(dir.path()).await;

            let raw: RawInfo =
                serde_json::from_value(json!({ "title": "Song", "id": "abc" })).expect("raw");
            let info = raw.normalize("https://example.com/v");

            let error = YtDlp::new(binary, DEFAULT_TIMEOUT)
                .download_video("https://example.com/v", &jar, &info, &downloads)
                .await
                .expect_err("debe fallar");
            assert!(matches!(error, CoreError::ArtifactNotFound { .. }));
        }
    }
}
