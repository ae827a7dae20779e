//! Almacén de metadatos: usuarios, documentos y turnos de chat.
//!
//! En Neo4j cada entidad es un nodo (`:User`, `:Document`, `:Chat`) y las
//! fechas se guardan como texto RFC 3339 en UTC.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use neo4rs::{query, Graph, Node};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    ChatTurn, Document, DocumentStatus, NewChat, NewDocument, SourceCitation, StatusUpdate,
    UserIdentity,
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Inserta o actualiza el usuario (clave: email) y devuelve su id.
    async fn sync_user(&self, identity: &UserIdentity) -> Result<String>;

    async fn create_document(&self, doc: NewDocument) -> Result<Document>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Documentos del usuario, la subida más reciente primero.
    async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>>;

    /// Aplica `update` sólo si el estado actual está en
    /// `update.status.allowed_predecessors()`. `None` si no existe o no procede.
    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Option<Document>>;

    /// Borra el documento si pertenece a `user_id`. `true` si se borró.
    async fn delete_document(&self, id: &str, user_id: &str) -> Result<bool>;

    /// Documentos aún no terminales cuya última actualización es anterior a `before`.
    async fn stale_documents(&self, before: DateTime<Utc>) -> Result<Vec<Document>>;

    async fn create_chat(&self, chat: NewChat) -> Result<ChatTurn>;

    /// Últimos turnos del usuario, el más reciente primero.
    async fn list_chats(&self, user_id: &str, limit: usize) -> Result<Vec<ChatTurn>>;

    /// Turnos de una conversación del usuario, en orden cronológico.
    async fn conversation(&self, user_id: &str, conversation_id: &str) -> Result<Vec<ChatTurn>>;
}

pub(crate) fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(node: &Node, key: &str) -> Result<DateTime<Utc>> {
    let raw: String = node
        .get(key)
        .ok_or_else(|| Error::storage(format!("Falta '{key}' en el nodo")))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(Error::storage)
}

fn document_from_node(node: &Node) -> Result<Document> {
    let text = |key: &str| -> Result<String> {
        node.get(key)
            .ok_or_else(|| Error::storage(format!("Falta '{key}' en :Document")))
    };
    let status = DocumentStatus::parse(&text("status")?)
        .ok_or_else(|| Error::storage("estado de documento desconocido"))?;
    let processed_at = match node.get::<String>("processed_at") {
        Some(_) => Some(parse_timestamp(node, "processed_at")?),
        None => None,
    };

    Ok(Document {
        id: text("id")?,
        user_id: text("user_id")?,
        name: text("name")?,
        size: node.get::<i64>("size").unwrap_or_default() as u64,
        mime_type: text("type")?,
        url: text("url")?,
        file_path: text("file_path")?,
        status,
        error: node.get("error"),
        chunk_count: node.get::<i64>("chunk_count").unwrap_or_default() as usize,
        text_length: node.get::<i64>("text_length").unwrap_or_default() as usize,
        uploaded_at: parse_timestamp(node, "uploaded_at")?,
        processed_at,
        created_at: parse_timestamp(node, "created_at")?,
        updated_at: parse_timestamp(node, "updated_at")?,
    })
}

fn chat_from_node(node: &Node) -> Result<ChatTurn> {
    let text = |key: &str| -> Result<String> {
        node.get(key)
            .ok_or_else(|| Error::storage(format!("Falta '{key}' en :Chat")))
    };
    let sources: Vec<SourceCitation> =
        serde_json::from_str(&text("sources")?).map_err(Error::storage)?;

    Ok(ChatTurn {
        id: text("id")?,
        user_id: text("user_id")?,
        conversation_id: text("conversation_id")?,
        query: text("query")?,
        response: text("response")?,
        document_ids: node.get("document_ids").unwrap_or_default(),
        sources,
        created_at: parse_timestamp(node, "created_at")?,
    })
}

fn status_names(statuses: &[DocumentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Metadatos persistidos como nodos de Neo4j.
pub struct Neo4jStore {
    graph: Arc<Graph>,
}

impl Neo4jStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    async fn documents(&self, q: neo4rs::Query) -> Result<Vec<Document>> {
        let mut cursor = self.graph.execute(q).await.map_err(Error::storage)?;
        let mut docs = Vec::new();
        while let Some(row) = cursor.next().await.map_err(Error::storage)? {
            let node: Node = row
                .get("d")
                .ok_or_else(|| Error::storage("Falta 'd' en resultado de Neo4j"))?;
            docs.push(document_from_node(&node)?);
        }
        Ok(docs)
    }

    async fn chats(&self, q: neo4rs::Query) -> Result<Vec<ChatTurn>> {
        let mut cursor = self.graph.execute(q).await.map_err(Error::storage)?;
        let mut chats = Vec::new();
        while let Some(row) = cursor.next().await.map_err(Error::storage)? {
            let node: Node = row
                .get("c")
                .ok_or_else(|| Error::storage("Falta 'c' en resultado de Neo4j"))?;
            chats.push(chat_from_node(&node)?);
        }
        Ok(chats)
    }
}

#[async_trait]
impl MetadataStore for Neo4jStore {
    async fn sync_user(&self, identity: &UserIdentity) -> Result<String> {
        let now = timestamp(&Utc::now());
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MERGE (u:User {email: $email})
                     ON CREATE SET u.id = $id, u.created_at = $now
                     SET u.name = $name, u.image = $image, u.subject = $subject,
                         u.updated_at = $now
                     RETURN u.id AS id",
                )
                .param("email", identity.email.clone())
                .param("id", Uuid::new_v4().to_string())
                .param("now", now)
                .param("name", identity.name.clone().unwrap_or_default())
                .param("image", identity.picture.clone().unwrap_or_default())
                .param("subject", identity.subject.clone().unwrap_or_default()),
            )
            .await
            .map_err(Error::storage)?;

        let row = cursor
            .next()
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::storage("MERGE de :User sin resultado"))?;
        row.get("id")
            .ok_or_else(|| Error::storage("Falta 'id' en :User"))
    }

    async fn create_document(&self, doc: NewDocument) -> Result<Document> {
        let doc = doc.into_document(Utc::now());
        let now = timestamp(&doc.created_at);
        let created = self
            .documents(
                query(
                    "CREATE (d:Document {
                        id: $id, user_id: $user_id, name: $name, size: $size, type: $type,
                        url: $url, file_path: $file_path, status: $status,
                        chunk_count: 0, text_length: 0,
                        uploaded_at: $now, created_at: $now, updated_at: $now
                     })
                     WITH d
                     OPTIONAL MATCH (u:User {id: $user_id})
                     FOREACH (_ IN CASE WHEN u IS NULL THEN [] ELSE [1] END |
                         MERGE (u)-[:UPLOADED]->(d))
                     RETURN d",
                )
                .param("id", doc.id.clone())
                .param("user_id", doc.user_id.clone())
                .param("name", doc.name.clone())
                .param("size", doc.size as i64)
                .param("type", doc.mime_type.clone())
                .param("url", doc.url.clone())
                .param("file_path", doc.file_path.clone())
                .param("status", doc.status.as_str())
                .param("now", now),
            )
            .await?;

        created
            .into_iter()
            .next()
            .ok_or_else(|| Error::storage("CREATE de :Document sin resultado"))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let docs = self
            .documents(query("MATCH (d:Document {id: $id}) RETURN d LIMIT 1").param("id", id))
            .await?;
        Ok(docs.into_iter().next())
    }

    async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>> {
        self.documents(
            query(
                "MATCH (d:Document {user_id: $user_id})
                 RETURN d ORDER BY d.uploaded_at DESC",
            )
            .param("user_id", user_id),
        )
        .await
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Option<Document>> {
        let now = timestamp(&Utc::now());
        let mut cypher = String::from(
            "MATCH (d:Document {id: $id}) WHERE d.status IN $from
             SET d.status = $status, d.chunk_count = $chunk_count,
                 d.text_length = $text_length, d.updated_at = $now",
        );
        if update.error.is_some() {
            cypher.push_str(", d.error = $error");
        }
        if update.status.is_terminal() {
            cypher.push_str(", d.processed_at = $now");
        }
        if update.error.is_none() {
            cypher.push_str(" REMOVE d.error");
        }
        cypher.push_str(" RETURN d");

        let mut q = query(&cypher)
            .param("id", id)
            .param("from", status_names(update.status.allowed_predecessors()))
            .param("status", update.status.as_str())
            .param("chunk_count", update.chunk_count as i64)
            .param("text_length", update.text_length as i64)
            .param("now", now);
        if let Some(error) = &update.error {
            q = q.param("error", error.clone());
        }

        Ok(self.documents(q).await?.into_iter().next())
    }

    async fn delete_document(&self, id: &str, user_id: &str) -> Result<bool> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (d:Document {id: $id, user_id: $user_id})
                     WITH d, d.id AS deleted_id
                     DETACH DELETE d
                     RETURN count(deleted_id) AS deleted",
                )
                .param("id", id)
                .param("user_id", user_id),
            )
            .await
            .map_err(Error::storage)?;

        let deleted = match cursor.next().await.map_err(Error::storage)? {
            Some(row) => row.get::<i64>("deleted").unwrap_or_default(),
            None => 0,
        };
        Ok(deleted > 0)
    }

    async fn stale_documents(&self, before: DateTime<Utc>) -> Result<Vec<Document>> {
        self.documents(
            query(
                "MATCH (d:Document)
                 WHERE d.status IN $statuses AND d.updated_at < $before
                 RETURN d",
            )
            .param(
                "statuses",
                status_names(&[DocumentStatus::Uploading, DocumentStatus::Processing]),
            )
            .param("before", timestamp(&before)),
        )
        .await
    }

    async fn create_chat(&self, chat: NewChat) -> Result<ChatTurn> {
        let turn = chat.into_turn(Utc::now());
        let sources = serde_json::to_string(&turn.sources).map_err(Error::storage)?;
        let created = self
            .chats(
                query(
                    "CREATE (c:Chat {
                        id: $id, user_id: $user_id, conversation_id: $conversation_id,
                        query: $query, response: $response, document_ids: $document_ids,
                        sources: $sources, created_at: $created_at
                     })
                     RETURN c",
                )
                .param("id", turn.id.clone())
                .param("user_id", turn.user_id.clone())
                .param("conversation_id", turn.conversation_id.clone())
                .param("query", turn.query.clone())
                .param("response", turn.response.clone())
                .param("document_ids", turn.document_ids.clone())
                .param("sources", sources)
                .param("created_at", timestamp(&turn.created_at)),
            )
            .await?;

        created
            .into_iter()
            .next()
            .ok_or_else(|| Error::storage("CREATE de :Chat sin resultado"))
    }

    async fn list_chats(&self, user_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        self.chats(
            query(
                "MATCH (c:Chat {user_id: $user_id})
                 RETURN c ORDER BY c.created_at DESC LIMIT $limit",
            )
            .param("user_id", user_id)
            .param("limit", limit as i64),
        )
        .await
    }

    async fn conversation(&self, user_id: &str, conversation_id: &str) -> Result<Vec<ChatTurn>> {
        self.chats(
            query(
                "MATCH (c:Chat {user_id: $user_id, conversation_id: $conversation_id})
                 RETURN c ORDER BY c.created_at ASC",
            )
            .param("user_id", user_id)
            .param("conversation_id", conversation_id),
        )
        .await
    }
}
