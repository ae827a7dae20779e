//! Ciclo de vida de un documento subido: almacenamiento, procesado
//! (extracción → normalización → chunking → embeddings → índice) y borrado.
//!
//! `uploading → processing → {ready | error}`. Un fallo durante el procesado
//! queda registrado como estado `error` con su mensaje; no hay reintentos.

use chrono::Utc;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    blob::BlobStore,
    chunker::{chunk_text, normalize_text, ChunkingConfig},
    error::{Error, Result},
    extract::extract_text,
    models::{Document, DocumentStatus, NewDocument, ProcessOutcome, StatusUpdate},
    store::MetadataStore,
    vector_store::VectorService,
};

pub const PROCESSING_TIMED_OUT: &str = "processing timed out";

/// Ejecuta un paso de limpieza; si falla lo registra y sigue.
async fn best_effort<F>(step: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    if let Err(err) = fut.await {
        warn!("Limpieza '{step}' fallida, se continúa: {err}");
    }
}

/// Los separadores de ruta del nombre original no pueden crear subdirectorios.
fn storage_file_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

pub struct DocumentLifecycle {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    vectors: VectorService,
    chunking: ChunkingConfig,
    process_timeout: Duration,
}

impl DocumentLifecycle {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        vectors: VectorService,
        chunking: ChunkingConfig,
        process_timeout: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            vectors,
            chunking,
            process_timeout,
        }
    }

    /// Guarda los bytes en `uploads/{user}/{millis}_{nombre}` y crea el
    /// documento en `uploading`.
    pub async fn begin_upload(
        &self,
        user_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<Document> {
        let path = format!(
            "uploads/{user_id}/{}_{}",
            Utc::now().timestamp_millis(),
            storage_file_name(file_name)
        );
        let blob = self.blobs.put(&path, bytes).await?;

        let doc = self
            .store
            .create_document(NewDocument {
                user_id: user_id.to_string(),
                name: file_name.to_string(),
                size: bytes.len() as u64,
                mime_type: mime_type.to_string(),
                url: blob.url,
                file_path: blob.path,
            })
            .await?;

        info!("Documento {} subido ({} bytes): {}", doc.id, doc.size, doc.name);
        Ok(doc)
    }

    /// Procesa un documento en `uploading` y deja su estado terminal escrito.
    pub async fn process(
        &self,
        document_id: &str,
        file_url: &str,
        file_name: &str,
        user_id: &str,
    ) -> Result<ProcessOutcome> {
        if self
            .store
            .update_status(document_id, StatusUpdate::processing())
            .await?
            .is_none()
        {
            return Err(match self.store.get_document(document_id).await? {
                Some(doc) => Error::InvalidTransition {
                    from: doc.status,
                    to: DocumentStatus::Processing,
                },
                None => Error::not_found(format!("documento {document_id}")),
            });
        }

        info!("Procesando documento {document_id} ({file_name})");
        match self.run_pipeline(document_id, file_url, file_name, user_id).await {
            Ok(outcome) => {
                let update = StatusUpdate::ready(outcome.chunk_count, outcome.text_length);
                if self.store.update_status(document_id, update).await?.is_none() {
                    // El barrido o un borrado cerró el documento mientras tanto.
                    warn!("Documento {document_id} cambió de estado durante el procesado, se retiran sus vectores");
                    best_effort(
                        "vectores",
                        self.vectors.delete_all(user_id, document_id, outcome.chunk_count),
                    )
                    .await;
                    return Err(match self.store.get_document(document_id).await? {
                        Some(doc) => Error::InvalidTransition {
                            from: doc.status,
                            to: DocumentStatus::Ready,
                        },
                        None => Error::not_found(format!("documento {document_id}")),
                    });
                }
                info!(
                    "Documento {document_id} listo: {} chunks, {} vectores, {} caracteres",
                    outcome.chunk_count, outcome.vector_count, outcome.text_length
                );
                Ok(outcome)
            }
            Err(err) => {
                error!("Error procesando documento {document_id}: {err}");
                self.record_failure(document_id, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        document_id: &str,
        file_url: &str,
        file_name: &str,
        user_id: &str,
    ) -> Result<ProcessOutcome> {
        let bytes = self.blobs.fetch(file_url).await?;

        let name = file_name.to_string();
        let raw = tokio::task::spawn_blocking(move || extract_text(&bytes, &name))
            .await
            .map_err(|e| Error::extraction(file_name, e))??;

        let text = normalize_text(&raw);
        if text.is_empty() {
            return Err(Error::EmptyDocument);
        }

        let chunks = chunk_text(&text, self.chunking);
        let vector_count = self
            .vectors
            .upsert_chunks(user_id, document_id, &chunks, file_name)
            .await?;

        Ok(ProcessOutcome {
            chunk_count: chunks.len(),
            vector_count,
            text_length: text.chars().count(),
        })
    }

    async fn record_failure(&self, document_id: &str, message: &str) {
        match self
            .store
            .update_status(document_id, StatusUpdate::failed(message))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!("No se pudo marcar {document_id} como error: ya no está en curso"),
            Err(err) => error!("No se pudo registrar el fallo de {document_id}: {err}"),
        }
    }

    /// [`process`](Self::process) acotado por `process_timeout`. Al expirar,
    /// el documento queda en `error` con [`PROCESSING_TIMED_OUT`].
    pub async fn process_bounded(
        &self,
        document_id: &str,
        file_url: &str,
        file_name: &str,
        user_id: &str,
    ) -> Result<ProcessOutcome> {
        let run = self.process(document_id, file_url, file_name, user_id);
        match tokio::time::timeout(self.process_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Documento {document_id} superó el tiempo de procesado ({:?})",
                    self.process_timeout
                );
                self.record_failure(document_id, PROCESSING_TIMED_OUT).await;
                Err(Error::ProcessingTimedOut)
            }
        }
    }

    /// Lanza el procesado acotado en segundo plano.
    pub fn dispatch(self: &Arc<Self>, doc: Document) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            // el resultado ya quedó escrito como estado del documento
            let _ = lifecycle
                .process_bounded(&doc.id, &doc.url, &doc.name, &doc.user_id)
                .await;
        })
    }

    /// Borra fichero, vectores y metadatos. Sólo el último paso puede fallar
    /// la operación; los anteriores se registran y se continúa.
    pub async fn delete(&self, document_id: &str, user_id: &str) -> Result<()> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("documento {document_id}")))?;
        if doc.user_id != user_id {
            return Err(Error::Forbidden);
        }

        best_effort("fichero", self.blobs.delete(&doc.url)).await;
        best_effort(
            "vectores",
            self.vectors.delete_all(user_id, document_id, doc.chunk_count),
        )
        .await;

        if !self.store.delete_document(document_id, user_id).await? {
            return Err(Error::not_found(format!("documento {document_id}")));
        }
        info!("Documento {document_id} eliminado ({} vectores)", doc.chunk_count);
        Ok(())
    }

    /// Marca como `error` los documentos en curso sin actividad desde hace
    /// más de `max_age`. Devuelve cuántos se marcaron.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).map_err(|e| Error::invalid(e.to_string()))?;
        let stale = self.store.stale_documents(Utc::now() - max_age).await?;

        let mut marked = 0;
        for doc in stale {
            if self
                .store
                .update_status(&doc.id, StatusUpdate::failed(PROCESSING_TIMED_OUT))
                .await?
                .is_some()
            {
                warn!("Documento {} atascado en '{}', marcado como error", doc.id, doc.status);
                marked += 1;
            }
        }
        if marked > 0 {
            info!("Barrido de documentos atascados: {marked} marcados");
        }
        Ok(marked)
    }
}
