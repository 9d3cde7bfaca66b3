use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errores internos del orquestador de descargas. Cada variante conserva la
/// etapa y la entrada que fallaron; el mapeo HTTP vive en `CoreError::status`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no se pudo aprovisionar el binario de extraccion: {0}")]
    Provisioning(String),

    #[error("no se pudo crear el contexto de cookies: {0}")]
    ContextCreation(String),

    #[error("fallo la operacion '{operation}' sobre {url}: {message}")]
    Extraction {
        operation: &'static str,
        url: String,
        message: String,
    },

    #[error("no se pudieron interpretar los metadatos de {url}: {message}")]
    MetadataParse { url: String, message: String },

    #[error("el extractor no devolvio una URL valida para {url}")]
    Resolution { url: String, output: String },

    #[error("no se encontro el archivo descargado para '{title}'")]
    ArtifactNotFound { title: String },

    #[error("fallo la conversion de audio: {message}")]
    Transcode { message: String },

    #[error("no se pudieron obtener metadatos del track {url}: {message}")]
    MetadataFetch { url: String, message: String },

    #[error("el servicio de conversion no acepto la solicitud: {message}")]
    ConversionRequest { message: String },

    #[error("la conversion remota fallo con estado {status}")]
    ConversionFailed { status: i64 },

    #[error("la conversion remota no termino despues de {attempts} intentos")]
    ConversionTimeout { attempts: u32 },

    #[error("sin resultados en la busqueda para '{query}'")]
    SearchNoResults { query: String },

    #[error("la operacion '{operation}' excedio el tiempo limite")]
    Cancelled { operation: &'static str },
}

impl CoreError {
    /// Los fallos de configuracion local (binario ausente, disco) se
    /// distinguen de los fallos de la fuente remota (familia 502).
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::Provisioning(_)
            | CoreError::ContextCreation(_)
            | CoreError::ArtifactNotFound { .. }
            | CoreError::Transcode { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            CoreError::Extraction { .. }
            | CoreError::MetadataParse { .. }
            | CoreError::Resolution { .. }
            | CoreError::MetadataFetch { .. }
            | CoreError::ConversionRequest { .. }
            | CoreError::ConversionFailed { .. } => StatusCode::BAD_GATEWAY,

            CoreError::ConversionTimeout { .. } | CoreError::Cancelled { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }

            CoreError::SearchNoResults { .. } => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Provisioning(_) => "PROVISIONING_FAILED",
            CoreError::ContextCreation(_) => "CONTEXT_CREATION_FAILED",
            CoreError::Extraction { .. } => "EXTRACTION_FAILED",
            CoreError::MetadataParse { .. } => "METADATA_PARSE_FAILED",
            CoreError::Resolution { .. } => "RESOLUTION_FAILED",
            CoreError::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            CoreError::Transcode { .. } => "TRANSCODE_FAILED",
            CoreError::MetadataFetch { .. } => "METADATA_FETCH_FAILED",
            CoreError::ConversionRequest { .. } => "CONVERSION_REQUEST_FAILED",
            CoreError::ConversionFailed { .. } => "CONVERSION_FAILED",
            CoreError::ConversionTimeout { .. } => "CONVERSION_TIMEOUT",
            CoreError::SearchNoResults { .. } => "SEARCH_NO_RESULTS",
            CoreError::Cancelled { .. } => "CANCELLED",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self {
            status: error.status(),
            message: error.to_string(),
            code: Some(error.code()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_is_internal_error() {
        let err = CoreError::Provisioning("sin red".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "PROVISIONING_FAILED");
    }

    #[test]
    fn upstream_failures_map_to_bad_gateway() {
        let variants = [
            CoreError::Extraction {
                operation: "info",
                url: "https://example.com/v".into(),
                message: "exit 1".into(),
            },
            CoreError::MetadataParse {
                url: "https://example.com/v".into(),
                message: "json truncado".into(),
            },
            CoreError::Resolution {
                url: "https://example.com/v".into(),
                output: "".into(),
            },
            CoreError::MetadataFetch {
                url: "https://open.spotify.com/track/x".into(),
                message: "sin payload".into(),
            },
            CoreError::ConversionRequest {
                message: "sin tid".into(),
            },
            CoreError::ConversionFailed { status: -1 },
        ];
        for err in variants {
            assert_eq!(err.status(), StatusCode::BAD_GATEWAY, "{err}");
        }
    }

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        assert_eq!(
            CoreError::ConversionTimeout { attempts: 3 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            CoreError::Cancelled { operation: "download" }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn search_without_results_is_404() {
        let err = CoreError::SearchNoResults {
            query: "artista cancion".into(),
        };
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn api_error_body_has_envelope_shape() {
        let api: ApiError = CoreError::ConversionTimeout { attempts: 3 }.into();
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn core_message_does_not_leak_paths() {
        let err = CoreError::ArtifactNotFound {
            title: "Video_de_prueba".into(),
        };
        assert!(!err.to_string().contains('/'));
    }
}
