use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cookies::COOKIE_SUFFIX;
use crate::dirs::MediaDirs;

/// Elimina jars de cookies mas viejos que la ventana de retencion. Los jars
/// vivos de jobs en vuelo son siempre mas recientes que la ventana, asi que
/// solo caen los huerfanos de procesos anteriores o de caidas.
pub async fn sweep_credentials(tmp_dir: &Path, older_than: Duration) {
    sweep(tmp_dir, older_than, |name| name.ends_with(COOKIE_SUFFIX)).await;
}

/// Envejecimiento opcional de artefactos materializados.
pub async fn sweep_artifacts(dir: &Path, older_than: Duration) {
    sweep(dir, older_than, |_| true).await;
}

async fn sweep(dir: &Path, older_than: Duration, matches: impl Fn(&str) -> bool) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("no se pudo abrir {dir:?} para limpieza: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("no se pudo iterar {dir:?} para limpieza: {error}");
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().to_string();
        if !matches(&name) {
            continue;
        }

        let path = entry.path();
        if !is_expired(&path, &entry, now, older_than).await {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("artefacto expirado eliminado: {name}"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("no se pudo eliminar {path:?}: {error}"),
        }
    }
}

async fn is_expired(
    path: &PathBuf,
    entry: &tokio::fs::DirEntry,
    now: SystemTime,
    older_than: Duration,
) -> bool {
    let metadata = match entry.metadata().await {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!("no se pudo leer metadata de {path:?}: {error}");
            return false;
        }
    };

    if !metadata.is_file() {
        return false;
    }

    let modified = match metadata.modified() {
        Ok(value) => value,
        Err(error) => {
            warn!("no se pudo leer fecha de {path:?}: {error}");
            return false;
        }
    };

    now.duration_since(modified).unwrap_or(Duration::ZERO) >= older_than
}

/// Barrido periodico en segundo plano: jars siempre, artefactos solo si se
/// configuro una retencion.
pub fn spawn_periodic(
    dirs: MediaDirs,
    interval: Duration,
    cookie_retention: Duration,
    artifact_retention: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // El primer tick es inmediato: barre lo que quedo de una corrida previa.
        loop {
            ticker.tick().await;
            sweep_credentials(&dirs.tmp, cookie_retention).await;
            if let Some(retention) = artifact_retention {
                sweep_artifacts(&dirs.downloads, retention).await;
                sweep_artifacts(&dirs.audio, retention).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_removes_expired_cookie_jars_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale_jar = dir.path().join("123_cookies.txt");
        let unrelated = dir.path().join("notas.txt");
        tokio::fs::write(&stale_jar, b"jar").await.expect("jar");
        tokio::fs::write(&unrelated, b"otro").await.expect("otro");

        // retencion cero: todo jar cuenta como expirado
        sweep_credentials(dir.path(), Duration::ZERO).await;

        assert!(!stale_jar.exists(), "el jar expirado debe eliminarse");
        assert!(unrelated.exists(), "otros archivos no se tocan");
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_cookie_jars() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fresh_jar = dir.path().join("456_cookies.txt");
        tokio::fs::write(&fresh_jar, b"jar").await.expect("jar");

        sweep_credentials(dir.path(), Duration::from_secs(3600)).await;

        assert!(fresh_jar.exists(), "un jar reciente debe sobrevivir");
    }

    #[tokio::test]
    async fn sweep_artifacts_ages_out_any_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let video = dir.path().join("Video_abc.mp4");
        tokio::fs::write(&video, b"v").await.expect("video");

        sweep_artifacts(dir.path(), Duration::ZERO).await;
        assert!(!video.exists());
    }

    #[tokio::test]
    async fn sweep_on_missing_directory_is_a_noop() {
        sweep_credentials(Path::new("/no/existe/tmp"), Duration::ZERO).await;
    }
}
