//! Backends en memoria: índice vectorial por fuerza bruta y almacén de
//! metadatos. Se usan con `STORAGE_BACKEND=memory` y en los tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ChatTurn, Document, DocumentStatus, NewChat, NewDocument, StatusUpdate, User, UserIdentity,
    VectorMatch, VectorRecord,
};
use crate::store::MetadataStore;
use crate::vector_store::VectorIndex;

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// namespace → (id → registro)
#[derive(Default)]
pub struct MemoryVectorIndex {
    namespaces: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
    #[cfg(test)]
    deleted: RwLock<Vec<(String, Vec<String>)>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryVectorIndex {
    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map_or(0, HashMap::len)
    }

    pub async fn ids(&self, namespace: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .namespaces
            .read()
            .await
            .get(namespace)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Llamadas a `delete_many` recibidas, en orden.
    pub async fn deletions(&self) -> Vec<(String, Vec<String>)> {
        self.deleted.read().await.clone()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let entries = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            entries.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn delete_many(&self, namespace: &str, ids: &[String]) -> Result<()> {
        #[cfg(test)]
        self.deleted
            .write()
            .await
            .push((namespace.to_string(), ids.to_vec()));

        if let Some(entries) = self.namespaces.write().await.get_mut(namespace) {
            for id in ids {
                entries.remove(id);
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f64],
        top_k: usize,
        document_ids: &[String],
    ) -> Result<Vec<VectorMatch>> {
        let namespaces = self.namespaces.read().await;
        let Some(entries) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = entries
            .values()
            .filter(|r| document_ids.contains(&r.metadata.document_id))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.values),
                metadata: r.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(top_k);
        Ok(matches)
    }
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    documents: HashMap<String, Document>,
    chats: Vec<ChatTurn>,
}

/// Almacén de metadatos en memoria; no sobrevive a un reinicio.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn sync_user(&self, identity: &UserIdentity) -> Result<String> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .entry(identity.email.clone())
            .or_insert_with(|| User {
                id: Uuid::new_v4().to_string(),
                email: identity.email.clone(),
                name: None,
                image: None,
                subject: None,
                created_at: now,
                updated_at: now,
            });
        user.name = identity.name.clone();
        user.image = identity.picture.clone();
        user.subject = identity.subject.clone();
        user.updated_at = now;
        Ok(user.id.clone())
    }

    async fn create_document(&self, doc: NewDocument) -> Result<Document> {
        let doc = doc.into_document(Utc::now());
        self.tables
            .write()
            .await
            .documents
            .insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.tables.read().await.documents.get(id).cloned())
    }

    async fn list_documents(&self, user_id: &str) -> Result<Vec<Document>> {
        let tables = self.tables.read().await;
        let mut docs: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(docs)
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Option<Document>> {
        let mut tables = self.tables.write().await;
        let Some(doc) = tables.documents.get_mut(id) else {
            return Ok(None);
        };
        if !doc.status.can_transition_to(update.status) {
            return Ok(None);
        }
        update.apply(doc, Utc::now());
        Ok(Some(doc.clone()))
    }

    async fn delete_document(&self, id: &str, user_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.documents.get(id) {
            Some(doc) if doc.user_id == user_id => {
                tables.documents.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stale_documents(&self, before: DateTime<Utc>) -> Result<Vec<Document>> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .values()
            .filter(|d| {
                matches!(d.status, DocumentStatus::Uploading | DocumentStatus::Processing)
                    && d.updated_at < before
            })
            .cloned()
            .collect())
    }

    async fn create_chat(&self, chat: NewChat) -> Result<ChatTurn> {
        let turn = chat.into_turn(Utc::now());
        self.tables.write().await.chats.push(turn.clone());
        Ok(turn)
    }

    async fn list_chats(&self, user_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let tables = self.tables.read().await;
        Ok(tables
            .chats
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn conversation(&self, user_id: &str, conversation_id: &str) -> Result<Vec<ChatTurn>> {
        let tables = self.tables.read().await;
        Ok(tables
            .chats
            .iter()
            .filter(|c| c.user_id == user_id && c.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
