//! Modelos de dominio: documentos y su ciclo de vida, turnos de chat,
//! usuarios y registros vectoriales.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Estado del ciclo de vida de un documento.
///
/// `uploading → processing → {ready | error}`; `ready` y `error` son terminales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Self::Uploading),
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }

    /// Estados desde los que se puede llegar a `self`.
    /// Los almacenes sólo aplican una actualización si el estado actual está aquí.
    pub fn allowed_predecessors(&self) -> &'static [DocumentStatus] {
        match self {
            Self::Uploading => &[],
            Self::Processing => &[Self::Uploading],
            Self::Ready => &[Self::Processing],
            // desde `uploading` sólo lo usa el barrido de documentos atascados
            Self::Error => &[Self::Uploading, Self::Processing],
        }
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Documento subido por un usuario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub url: String,
    pub file_path: String,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub chunk_count: usize,
    pub text_length: usize,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Datos para crear un documento recién subido.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub user_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub url: String,
    pub file_path: String,
}

impl NewDocument {
    /// Materializa el documento en estado `uploading`.
    pub fn into_document(self, now: DateTime<Utc>) -> Document {
        Document {
            id: Uuid::new_v4().to_string(),
            user_id: self.user_id,
            name: self.name,
            size: self.size,
            mime_type: self.mime_type,
            url: self.url,
            file_path: self.file_path,
            status: DocumentStatus::Uploading,
            error: None,
            chunk_count: 0,
            text_length: 0,
            uploaded_at: now,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Cambio de estado que se persiste sobre un documento.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub chunk_count: usize,
    pub text_length: usize,
}

impl StatusUpdate {
    pub fn processing() -> Self {
        Self {
            status: DocumentStatus::Processing,
            error: None,
            chunk_count: 0,
            text_length: 0,
        }
    }

    pub fn ready(chunk_count: usize, text_length: usize) -> Self {
        Self {
            status: DocumentStatus::Ready,
            error: None,
            chunk_count,
            text_length,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: DocumentStatus::Error,
            error: Some(message.into()),
            chunk_count: 0,
            text_length: 0,
        }
    }

    /// Aplica el cambio sobre una copia en memoria del documento.
    pub fn apply(&self, doc: &mut Document, now: DateTime<Utc>) {
        doc.status = self.status;
        doc.error = self.error.clone();
        doc.chunk_count = self.chunk_count;
        doc.text_length = self.text_length;
        doc.updated_at = now;
        if self.status.is_terminal() {
            doc.processed_at = Some(now);
        }
    }
}

/// Identidad que entrega el proveedor de autenticación.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cita de una fuente devuelta junto a una respuesta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCitation {
    pub document_id: String,
    pub chunk_index: usize,
    pub score: f64,
    pub text: String,
}

/// Turno de chat pendiente de persistir.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub query: String,
    pub response: String,
    pub document_ids: Vec<String>,
    pub sources: Vec<SourceCitation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub query: String,
    pub response: String,
    pub document_ids: Vec<String>,
    pub sources: Vec<SourceCitation>,
    pub created_at: DateTime<Utc>,
}

impl NewChat {
    /// Sin conversación previa, el propio id del turno pasa a agrupar la conversación.
    pub fn into_turn(self, now: DateTime<Utc>) -> ChatTurn {
        let id = Uuid::new_v4().to_string();
        let conversation_id = self.conversation_id.unwrap_or_else(|| id.clone());
        ChatTurn {
            id,
            user_id: self.user_id,
            conversation_id,
            query: self.query,
            response: self.response,
            document_ids: self.document_ids,
            sources: self.sources,
            created_at: now,
        }
    }
}

/// Un id de conversación sólo es válido en la forma textual canónica 8-4-4-4-12.
pub fn parse_conversation_id(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.len() != 36 {
        return None;
    }
    Uuid::parse_str(raw).ok().map(|_| raw.to_lowercase())
}

/// Metadatos que acompañan a cada vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub chunk_count: usize,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f64>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f64,
    pub metadata: VectorMetadata,
}

/// Resultado de procesar un documento de principio a fin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub chunk_count: usize,
    pub vector_count: usize,
    pub text_length: usize,
}

/// Respuesta generada más las fuentes consultadas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<SourceCitation>,
}
