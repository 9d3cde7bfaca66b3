use std::path::{Path, PathBuf};

use crate::error::ApiError;

/// Directorios de trabajo del servicio. Se crean una sola vez en el arranque;
/// ningun componente vuelve a verificarlos por request.
#[derive(Debug, Clone)]
pub struct MediaDirs {
    pub bin: PathBuf,
    pub tmp: PathBuf,
    pub downloads: PathBuf,
    pub audio: PathBuf,
}

impl MediaDirs {
    pub fn new(root: &Path) -> Self {
        Self {
            bin: root.join("bin"),
            tmp: root.join("tmp"),
            downloads: root.join("downloads"),
            audio: root.join("audio"),
        }
    }

    pub async fn ensure_all(&self) -> Result<(), ApiError> {
        for dir in [&self.bin, &self.tmp, &self.downloads, &self.audio] {
            tokio::fs::create_dir_all(dir).await.map_err(|error| {
                ApiError::internal(format!("No se pudo crear la carpeta de trabajo: {error}"))
            })?;
        }
        Ok(())
    }

    pub fn ytdlp_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.bin.join("yt-dlp.exe")
        } else {
            self.bin.join("yt-dlp")
        }
    }
}
