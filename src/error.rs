//! Taxonomía de errores del servicio y su traducción a respuestas HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::DocumentStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Extensión de fichero fuera de PDF/DOCX/TXT.
    #[error("Tipo de fichero no soportado: '{0}'")]
    UnsupportedFileType(String),

    #[error("No se pudo extraer texto de '{file_name}': {message}")]
    ExtractionFailed { file_name: String, message: String },

    #[error("No se encontró contenido de texto en el documento")]
    EmptyDocument,

    /// Fallo del proveedor de embeddings o del índice vectorial.
    #[error("Índice vectorial no disponible: {0}")]
    IndexUnavailable(String),

    #[error("No se pudo generar la respuesta: {0}")]
    AnswerGenerationFailed(String),

    #[error("No autenticado")]
    Unauthorized,

    #[error("Acceso denegado")]
    Forbidden,

    #[error("No encontrado: {0}")]
    NotFound(String),

    #[error("Petición inválida: {0}")]
    InvalidRequest(String),

    #[error("Transición de estado inválida: {from} -> {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("El procesado del documento superó el tiempo máximo")]
    ProcessingTimedOut,

    /// Fallo del almacén de metadatos o del almacén de ficheros.
    #[error("Error de almacenamiento: {0}")]
    Storage(String),

    #[error("Error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn extraction(file_name: impl Into<String>, message: impl ToString) -> Self {
        Self::ExtractionFailed {
            file_name: file_name.into(),
            message: message.to_string(),
        }
    }

    pub fn index(message: impl ToString) -> Self {
        Self::IndexUnavailable(message.to_string())
    }

    pub fn storage(message: impl ToString) -> Self {
        Self::Storage(message.to_string())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            Error::UnsupportedFileType(_) => (StatusCode::BAD_REQUEST, "unsupported_file_type"),
            Error::ExtractionFailed { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "extraction_failed")
            }
            Error::EmptyDocument => (StatusCode::UNPROCESSABLE_ENTITY, "empty_document"),
            Error::IndexUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "index_unavailable"),
            Error::AnswerGenerationFailed(_) => {
                (StatusCode::BAD_GATEWAY, "answer_generation_failed")
            }
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Error::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            Error::ProcessingTimedOut => (StatusCode::GATEWAY_TIMEOUT, "processing_timed_out"),
            Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = self.kind();
        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
