//! Índice vectorial por usuario.
//!
//! API pública:
//!   - [`VectorIndex`]: backend con espacios de nombres (`upsert`, `delete_many`, `query`).
//!   - [`VectorService`]: genera embeddings por lotes y fija el espacio
//!     `user-{userId}` y los ids `{documentId}_chunk_{i}`.
//!   - [`Neo4jVectorIndex`]: backend sobre nodos `:Chunk` en Neo4j; la
//!     similitud se calcula dentro del espacio y los documentos pedidos.

use async_trait::async_trait;
use futures::future::try_join_all;
use neo4rs::{query, Graph};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::llm::EmbeddingProvider;
use crate::models::{VectorMatch, VectorMetadata, VectorRecord};

/// Caracteres del chunk que se guardan como metadato para el contexto.
pub const STORED_TEXT_CHARS: usize = 1000;

pub const CHUNK_INDEX_NAME: &str = "chunkEmbeddingIndex";

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()>;

    async fn delete_many(&self, namespace: &str, ids: &[String]) -> Result<()>;

    /// Los `top_k` vecinos más cercanos de `namespace` cuyo `documentId`
    /// está en `document_ids`, por similitud descendente.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f64],
        top_k: usize,
        document_ids: &[String],
    ) -> Result<Vec<VectorMatch>>;
}

pub fn user_namespace(user_id: &str) -> String {
    format!("user-{user_id}")
}

pub fn vector_id(document_id: &str, chunk_index: usize) -> String {
    format!("{document_id}_chunk_{chunk_index}")
}

/// Ids de todos los chunks de un documento: `_chunk_0 .. _chunk_{n-1}`.
pub fn vector_ids(document_id: &str, chunk_count: usize) -> Vec<String> {
    (0..chunk_count).map(|i| vector_id(document_id, i)).collect()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Embeddings en lotes de `batch_size`: concurrentes dentro del lote,
/// lotes estrictamente secuenciales. Un fallo aborta todo.
pub async fn embed_in_batches(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f64>>> {
    let expected = embedder.dimensions();
    let mut vectors = Vec::with_capacity(texts.len());

    for (batch_no, batch) in texts.chunks(batch_size.max(1)).enumerate() {
        debug!("Generando embeddings del lote {} ({} textos)", batch_no, batch.len());
        let embedded = try_join_all(batch.iter().map(|t| embedder.embed(t))).await?;
        for vector in embedded {
            if vector.len() != expected {
                return Err(Error::index(format!(
                    "dimensión del embedding {} distinta de la del índice {}",
                    vector.len(),
                    expected
                )));
            }
            vectors.push(vector);
        }
    }

    Ok(vectors)
}

/// Escritura y lectura de chunks de documentos en el índice vectorial.
#[derive(Clone)]
pub struct VectorService {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    batch_size: usize,
}

impl VectorService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            batch_size,
        }
    }

    /// Un registro por chunk en `user-{user_id}`. Devuelve los registros escritos.
    pub async fn upsert_chunks(
        &self,
        user_id: &str,
        document_id: &str,
        chunks: &[String],
        file_name: &str,
    ) -> Result<usize> {
        let vectors = embed_in_batches(self.embedder.as_ref(), chunks, self.batch_size).await?;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, values))| VectorRecord {
                id: vector_id(document_id, i),
                values,
                metadata: VectorMetadata {
                    document_id: document_id.to_string(),
                    chunk_index: i,
                    text: truncate_chars(text, STORED_TEXT_CHARS),
                    chunk_count: chunks.len(),
                    file_name: file_name.to_string(),
                },
            })
            .collect();

        let written = records.len();
        self.index.upsert(&user_namespace(user_id), records).await?;
        Ok(written)
    }

    pub async fn delete_all(
        &self,
        user_id: &str,
        document_id: &str,
        chunk_count: usize,
    ) -> Result<()> {
        if chunk_count == 0 {
            return Ok(());
        }
        let ids = vector_ids(document_id, chunk_count);
        self.index.delete_many(&user_namespace(user_id), &ids).await
    }

    pub async fn search(
        &self,
        user_id: &str,
        query_text: &str,
        document_ids: &[String],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let vector = self.embedder.embed(query_text).await?;
        let expected = self.embedder.dimensions();
        if vector.len() != expected {
            return Err(Error::index(format!(
                "dimensión del embedding de la pregunta {} distinta de la del índice {}",
                vector.len(),
                expected
            )));
        }
        self.index
            .query(&user_namespace(user_id), &vector, top_k, document_ids)
            .await
    }
}

/// Escritura de todos los registros en una sola consulta: `UNWIND` sobre
/// columnas paralelas, una por propiedad del nodo.
pub(crate) const UPSERT_CYPHER: &str = "UNWIND range(0, size($ids) - 1) AS i
     MERGE (c:Chunk {namespace: $namespace, id: $ids[i]})
     SET c.embedding = $embeddings[i], c.document_id = $document_ids[i],
         c.chunk_index = $chunk_indexes[i], c.text = $texts[i],
         c.chunk_count = $chunk_counts[i], c.file_name = $file_names[i]";

/// Similitud exacta restringida al espacio y a los documentos pedidos.
pub(crate) const SCOPED_QUERY_CYPHER: &str = "MATCH (c:Chunk {namespace: $namespace})
     WHERE c.document_id IN $document_ids
     WITH c, vector.similarity.cosine(c.embedding, $embedding) AS score
     ORDER BY score DESC
     LIMIT $top_k
     RETURN c.id AS id, score, c.document_id AS document_id,
            c.chunk_index AS chunk_index, c.text AS text,
            c.chunk_count AS chunk_count, c.file_name AS file_name";

/// Registros desplegados en columnas para [`UPSERT_CYPHER`].
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ChunkColumns {
    pub ids: Vec<String>,
    pub embeddings: Vec<Vec<f64>>,
    pub document_ids: Vec<String>,
    pub chunk_indexes: Vec<i64>,
    pub texts: Vec<String>,
    pub chunk_counts: Vec<i64>,
    pub file_names: Vec<String>,
}

impl ChunkColumns {
    pub fn from_records(records: Vec<VectorRecord>) -> Self {
        let mut columns = Self::default();
        for record in records {
            columns.ids.push(record.id);
            columns.embeddings.push(record.values);
            columns.document_ids.push(record.metadata.document_id);
            columns.chunk_indexes.push(record.metadata.chunk_index as i64);
            columns.texts.push(record.metadata.text);
            columns.chunk_counts.push(record.metadata.chunk_count as i64);
            columns.file_names.push(record.metadata.file_name);
        }
        columns
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Backend Neo4j: cada registro es un nodo `:Chunk` con su espacio de nombres.
pub struct Neo4jVectorIndex {
    graph: Arc<Graph>,
}

impl Neo4jVectorIndex {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl VectorIndex for Neo4jVectorIndex {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let columns = ChunkColumns::from_records(records);
        let written = columns.len();

        self.graph
            .run(
                query(UPSERT_CYPHER)
                    .param("namespace", namespace)
                    .param("ids", columns.ids)
                    .param("embeddings", columns.embeddings)
                    .param("document_ids", columns.document_ids)
                    .param("chunk_indexes", columns.chunk_indexes)
                    .param("texts", columns.texts)
                    .param("chunk_counts", columns.chunk_counts)
                    .param("file_names", columns.file_names),
            )
            .await
            .map_err(Error::index)?;

        info!("{written} vectores escritos en '{namespace}'");
        Ok(())
    }

    async fn delete_many(&self, namespace: &str, ids: &[String]) -> Result<()> {
        self.graph
            .run(
                query(
                    "MATCH (c:Chunk) WHERE c.namespace = $namespace AND c.id IN $ids
                     DETACH DELETE c",
                )
                .param("namespace", namespace)
                .param("ids", ids.to_vec()),
            )
            .await
            .map_err(Error::index)
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f64],
        top_k: usize,
        document_ids: &[String],
    ) -> Result<Vec<VectorMatch>> {
        if document_ids.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut cursor = self
            .graph
            .execute(
                query(SCOPED_QUERY_CYPHER)
                    .param("embedding", vector.to_vec())
                    .param("namespace", namespace)
                    .param("document_ids", document_ids.to_vec())
                    .param("top_k", top_k as i64),
            )
            .await
            .map_err(Error::index)?;

        let mut matches = Vec::new();
        while let Some(row) = cursor.next().await.map_err(Error::index)? {
            let field = |name: &str| Error::index(format!("Falta campo '{name}' en resultado de Neo4j"));
            let id: String = row.get("id").ok_or_else(|| field("id"))?;
            let score: f64 = row.get("score").ok_or_else(|| field("score"))?;
            let document_id: String = row.get("document_id").ok_or_else(|| field("document_id"))?;
            let chunk_index: i64 = row.get("chunk_index").ok_or_else(|| field("chunk_index"))?;
            let text: String = row.get("text").unwrap_or_default();
            let chunk_count: i64 = row.get("chunk_count").unwrap_or_default();
            let file_name: String = row.get("file_name").unwrap_or_default();

            matches.push(VectorMatch {
                id,
                score,
                metadata: VectorMetadata {
                    document_id,
                    chunk_index: chunk_index as usize,
                    text,
                    chunk_count: chunk_count as usize,
                    file_name,
                },
            });
        }

        Ok(matches)
    }
}
