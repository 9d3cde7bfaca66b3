use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::CoreError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Divisor del mapeo bitrate -> indice de calidad 0-10 de vorbis.
const OGG_QUALITY_DIVISOR: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
    Ogg,
    Wav,
}

impl AudioFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mp3" => Some(Self::Mp3),
            "aac" => Some(Self::Aac),
            "ogg" => Some(Self::Ogg),
            "wav" => Some(Self::Wav),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
        }
    }

    /// Identificador del codificador externo.
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Aac => "aac",
            Self::Ogg => "libvorbis",
            Self::Wav => "pcm_s16le",
        }
    }

    /// Bitrate constante salvo para ogg, cuyo codificador trabaja con un
    /// indice de calidad 0-10 derivado del bitrate solicitado.
    pub fn quality_args(&self, kbps: u32) -> [String; 2] {
        match self {
            Self::Ogg => ["-q:a".to_string(), kbps.div_ceil(OGG_QUALITY_DIVISOR).to_string()],
            _ => ["-b:a".to_string(), format!("{kbps}k")],
        }
    }
}

/// Cliente del binario de transcodificacion. Siempre escribe un archivo nuevo;
/// nunca muta ni borra la fuente.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: PathBuf,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub async fn convert(
        &self,
        source: &Path,
        audio_dir: &Path,
        format: AudioFormat,
        quality_kbps: u32,
    ) -> Result<PathBuf, CoreError> {
        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("audio");
        let destination = audio_dir.join(format!("{stem}.{}", format.as_str()));

        let [quality_flag, quality_value] = format.quality_args(quality_kbps);
        let command_future = Command::new(&self.binary)
            .arg("-i")
            .arg(source)
            .arg("-vn")
            .arg("-acodec")
            .arg(format.codec())
            .arg(quality_flag)
            .arg(quality_value)
            .arg(&destination)
            .arg("-y")
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| CoreError::Cancelled {
                operation: "transcode",
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    CoreError::Transcode {
                        message: "el binario de transcodificacion no esta disponible".to_string(),
                    }
                } else {
                    CoreError::Transcode {
                        message: error.to_string(),
                    }
                }
            })?;

        if !output.status.success() {
            return Err(CoreError::Transcode {
                message: String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .next_back()
                    .unwrap_or("la conversion termino con error")
                    .to_string(),
            });
        }

        if !tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            return Err(CoreError::Transcode {
                message: "el archivo convertido no aparecio en el destino".to_string(),
            });
        }

        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_only_supported_formats() {
        assert_eq!(AudioFormat::parse("mp3"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::parse("wav"), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::parse("flac"), None);
        assert_eq!(AudioFormat::parse(""), None);
    }

    #[test]
    fn codec_mapping_matches_encoders() {
        assert_eq!(AudioFormat::Mp3.codec(), "libmp3lame");
        assert_eq!(AudioFormat::Aac.codec(), "aac");
        assert_eq!(AudioFormat::Ogg.codec(), "libvorbis");
        assert_eq!(AudioFormat::Wav.codec(), "pcm_s16le");
    }

    #[test]
    fn ogg_quality_uses_zero_to_ten_scale() {
        assert_eq!(
            AudioFormat::Ogg.quality_args(192),
            ["-q:a".to_string(), "6".to_string()]
        );
        assert_eq!(
            AudioFormat::Ogg.quality_args(320),
            ["-q:a".to_string(), "10".to_string()]
        );
        // 33/32 redondea hacia arriba
        assert_eq!(
            AudioFormat::Ogg.quality_args(33),
            ["-q:a".to_string(), "2".to_string()]
        );
    }

    #[test]
    fn other_formats_use_constant_bitrate() {
        assert_eq!(
            AudioFormat::Mp3.quality_args(192),
            ["-b:a".to_string(), "192k".to_string()]
        );
        assert_eq!(
            AudioFormat::Wav.quality_args(128),
            ["-b:a".to_string(), "128k".to_string()]
        );
    }

    #[cfg(unix)]
    mod with_fake_binary {
        use super::*;

        async fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let path = dir.join("ffmpeg");
            tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
                .await
                .expect("script");
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .expect("chmod");
            path
        }

        #[tokio::test]
        async fn convert_writes_new_file_and_keeps_source() {
            let dir = tempfile::tempdir().expect("tempdir");
            let audio_dir = dir.path().join("audio");
            tokio::fs::create_dir_all(&audio_dir).await.expect("dir");

            let source = dir.path().join("Video_abc.mp4");
            tokio::fs::write(&source, b"fuente").await.expect("source");

            let expected = audio_dir.join("Video_abc.mp3");
            let binary =
                fake_ffmpeg(dir.path(), &format!("touch '{}'", expected.display())).await;

            let converted = Ffmpeg::new(binary, DEFAULT_TIMEOUT)
                .convert(&source, &audio_dir, AudioFormat::Mp3, 192)
                .await
                .expect("convertir");

            assert_eq!(converted, expected);
            assert!(source.exists(), "la fuente no debe tocarse");
        }

        #[tokio::test]
        async fn convert_fails_when_output_is_missing() {
            let dir = tempfile::tempdir().expect("tempdir");
            let audio_dir = dir.path().join("audio");
            tokio::fs::create_dir_all(&audio_dir).await.expect("dir");

            let source = dir.path().join("Video_abc.mp4");
            tokio::fs::write(&source, b"fuente").await.expect("source");

            let binary = fake_ffmpeg(dir.path(), "true").await;
            let error = Ffmpeg::new(binary, DEFAULT_TIMEOUT)
                .convert(&source, &audio_dir, AudioFormat::Mp3, 192)
                .await
                .expect_err("debe fallar");
            assert!(matches!(error, CoreError::Transcode { .. }));
        }

        #[tokio::test]
        async fn convert_surfaces_encoder_errors() {
            let dir = tempfile::tempdir().expect("tempdir");
            let audio_dir = dir.path().join("audio");
            tokio::fs::create_dir_all(&audio_dir).await.expect("dir");

            let source = dir.path().join("Video_abc.mp4");
            tokio::fs::write(&source, b"fuente").await.expect("source");

            let binary =
                fake_ffmpeg(dir.path(), "echo 'codec no soportado' >&2\nexit 1").await;
            let error = Ffmpeg::new(binary, DEFAULT_TIMEOUT)
                .convert(&source, &audio_dir, AudioFormat::Ogg, 192)
                .await
                .expect_err("debe fallar");
            match error {
                CoreError::Transcode { message } => {
                    assert!(message.contains("codec no soportado"))
                }
                other => panic!("variante inesperada: {other:?}"),
            }
        }
    }
}
