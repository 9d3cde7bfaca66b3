use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;

/// Contenido fijo del jar en gramatica Netscape: comentario marcador y lineas
/// `dominio  subdominios  ruta  seguro  expira  clave  valor` separadas por
/// tabuladores. Valores de sesion genericos, suficientes para el extractor.
const COOKIE_LINES: &[&str] = &[
    "# Netscape HTTP Cookie File",
    "# This is a generated file! Do not edit.",
    ".youtube.com\tTRUE\t/\tTRUE\t1799999999\tPREF\tf6=40000000&tz=UTC",
    ".youtube.com\tTRUE\t/\tTRUE\t1799999999\tGPS\t1",
    ".youtube.com\tTRUE\t/\tTRUE\t0\tYSC\tmedia-download-api",
    ".youtube.com\tTRUE\t/\tTRUE\t1799999999\tVISITOR_INFO1_LIVE\tmedia-download-api",
    ".youtube.com\tTRUE\t/\tFALSE\t1799999999\tCONSENT\tYES+1",
];

pub const COOKIE_SUFFIX: &str = "_cookies.txt";

/// Jar de cookies efimero, propiedad exclusiva del job que lo creo.
#[derive(Debug)]
pub struct CookieJar {
    path: PathBuf,
}

impl CookieJar {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct CookieFactory {
    tmp_dir: PathBuf,
}

impl CookieFactory {
    pub fn new(tmp_dir: PathBuf) -> Self {
        Self { tmp_dir }
    }

    /// Crea un jar con nombre resistente a colisiones: milisegundos actuales
    /// mas un uuid, para que dos jobs en el mismo milisegundo no compartan
    /// sesion.
    pub async fn create(&self) -> Result<CookieJar, CoreError> {
        let name = format!(
            "{}_{}{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            COOKIE_SUFFIX
        );
        let path = self.tmp_dir.join(name);

        tokio::fs::write(&path, COOKIE_LINES.join("\n"))
            .await
            .map_err(|error| CoreError::ContextCreation(error.to_string()))?;

        Ok(CookieJar { path })
    }

    /// Idempotente: un jar ya eliminado no es un error.
    pub async fn destroy(&self, jar: &CookieJar) {
        match tokio::fs::remove_file(&jar.path).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!("no se pudo eliminar el jar de cookies {:?}: {error}", jar.path);
            }
        }
    }
}
