use std::path::PathBuf;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::CoreError;

pub const DEFAULT_RELEASE_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";

/// Aprovisiona el binario de extraccion en `binary_path`. El intento de
/// descarga se memoiza en una `OnceCell`: N llamadas concurrentes antes de que
/// el binario exista colapsan en un unico intento y todas observan el mismo
/// resultado.
pub struct Provisioner {
    binary_path: PathBuf,
    release_url: String,
    client: reqwest::Client,
    attempt: OnceCell<Result<(), String>>,
}

impl Provisioner {
    pub fn new(binary_path: PathBuf, release_url: String, client: reqwest::Client) -> Self {
        Self {
            binary_path,
            release_url,
            client,
            attempt: OnceCell::new(),
        }
    }

    pub async fn ensure(&self) -> Result<(), CoreError> {
        // Camino rapido: binario ya presente, cero I/O de red.
        if tokio::fs::try_exists(&self.binary_path).await.unwrap_or(false) {
            return Ok(());
        }

        let outcome = self.attempt.get_or_init(|| self.provision()).await;
        outcome
            .clone()
            .map_err(CoreError::Provisioning)
    }

    /// Cadena de metodos de obtencion: cliente HTTP propio y, si falla, `curl`
    /// como herramienta externa. El primero que deja el archivo verificado en
    /// su sitio gana.
    async fn provision(&self) -> Result<(), String> {
        if tokio::fs::try_exists(&self.binary_path).await.unwrap_or(false) {
            return Ok(());
        }

        let staging = self.binary_path.with_extension("part");
        let mut failures = Vec::new();

        for label in ["reqwest", "curl"] {
            let result = match label {
                "reqwest" => self.fetch_via_http(&staging).await,
                _ => self.fetch_via_curl(&staging).await,
            };
            match result {
                Ok(()) => match self.commit(&staging).await {
                    Ok(()) => {
                        info!("binario de extraccion aprovisionado via {label}");
                        return Ok(());
                    }
                    Err(error) => failures.push(format!("{label}: {error}")),
                },
                Err(error) => {
                    warn!("fallo el metodo de aprovisionamiento {label}: {error}");
                    failures.push(format!("{label}: {error}"));
                    let _ = tokio::fs::remove_file(&staging).await;
                }
            }
        }

        let _ = tokio::fs::remove_file(&staging).await;
        Err(failures.join("; "))
    }

    async fn fetch_via_http(&self, staging: &PathBuf) -> Result<(), String> {
        let response = self
            .client
            .get(&self.release_url)
            .send()
            .await
            .map_err(|error| format!("no se pudo conectar: {error}"))?;

        if !response.status().is_success() {
            return Err(format!("estado HTTP {}", response.status()));
        }

        let mut file = tokio::fs::File::create(staging)
            .await
            .map_err(|error| format!("no se pudo crear archivo temporal: {error}"))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| format!("error de stream: {error}"))?;
            file.write_all(&chunk)
                .await
                .map_err(|error| format!("error de escritura: {error}"))?;
        }
        file.flush()
            .await
            .map_err(|error| format!("error al vaciar buffer: {error}"))?;

        Ok(())
    }

    async fn fetch_via_curl(&self, staging: &PathBuf) -> Result<(), String> {
        let output = Command::new("curl")
            .arg("-fsSL")
            .arg("-o")
            .arg(staging)
            .arg(&self.release_url)
            .output()
            .await
            .map_err(|error| format!("no se pudo ejecutar curl: {error}"))?;

        if !output.status.success() {
            return Err(format!(
                "curl termino con {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(())
    }

    /// Verifica la descarga y la publica de forma atomica: un fallo aqui nunca
    /// deja un archivo parcial en la ruta final.
    async fn commit(&self, staging: &PathBuf) -> Result<(), String> {
        let metadata = tokio::fs::metadata(staging)
            .await
            .map_err(|error| format!("descarga ausente: {error}"))?;
        if metadata.len() == 0 {
            let _ = tokio::fs::remove_file(staging).await;
            return Err("la descarga quedo vacia".to_string());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(staging, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|error| format!("no se pudieron ajustar permisos: {error}"))?;
        }

        tokio::fs::rename(staging, &self.binary_path)
            .await
            .map_err(|error| format!("no se pudo publicar el binario: {error}"))
    }
}
