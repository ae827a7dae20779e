use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    app_state::AppState,
    auth::AuthUser,
    error::{Error, Result},
    extract::{FileKind, ACCEPTED_MIME_TYPES},
    models::{
        parse_conversation_id, ChatTurn, Document, NewChat, ProcessOutcome, SourceCitation,
    },
};

const DEFAULT_CHAT_PAGE: usize = 50;
const MAX_CHAT_PAGE: usize = 200;

/// Margen para las cabeceras y delimitadores del multipart.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPayload {
    document_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    success: bool,
    document_id: String,
    #[serde(flatten)]
    outcome: ProcessOutcome,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(default)]
    query: String,
    #[serde(default)]
    document_ids: Vec<String>,
    conversation_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    response: String,
    sources: Vec<SourceCitation>,
    chat_id: String,
    conversation_id: String,
}

#[derive(Deserialize)]
pub struct ChatListParams {
    limit: Option<usize>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let upload_limit = app_state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/documents", get(list_documents_handler))
        .route(
            "/api/documents/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/documents/process", post(process_handler))
        .route(
            "/api/documents/:id",
            get(get_document_handler).delete(delete_document_handler),
        )
        .route("/api/chat", post(chat_handler))
        .route("/api/chats", get(list_chats_handler))
        .route("/api/chats/:conversation_id", get(conversation_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.config.storage_backend.name(),
    }))
}

#[axum::debug_handler(state = AppState)]
async fn list_documents_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Document>>> {
    Ok(Json(state.store.list_documents(&user.id).await?))
}

/// Tipo MIME efectivo: el declarado (sin parámetros) o, si no aporta nada,
/// el deducido de la extensión.
fn effective_mime(declared: Option<&str>, file_name: &str) -> String {
    let declared = declared
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_lowercase())
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");
    declared.unwrap_or_else(|| {
        mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    })
}

#[axum::debug_handler(state = AppState)]
async fn upload_handler(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::invalid(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::invalid("el campo 'file' no trae nombre de fichero"))?;
        let mime = effective_mime(field.content_type(), &file_name);
        let kind = FileKind::from_file_name(&file_name)?;
        if !ACCEPTED_MIME_TYPES.contains(&mime.as_str()) || mime != kind.mime_type() {
            return Err(Error::UnsupportedFileType(mime));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::invalid(e.to_string()))?;
        if bytes.len() > state.config.max_upload_bytes {
            return Err(Error::invalid(format!(
                "el fichero supera el máximo de {} bytes",
                state.config.max_upload_bytes
            )));
        }

        let doc = state
            .lifecycle
            .begin_upload(&user.id, &file_name, kind.mime_type(), &bytes)
            .await?;
        state.lifecycle.dispatch(doc.clone());
        return Ok((StatusCode::CREATED, Json(doc)));
    }

    Err(Error::invalid("falta el campo 'file'"))
}

/// Documento del usuario o el error que corresponda (404/403).
async fn owned_document(state: &AppState, user: &AuthUser, id: &str) -> Result<Document> {
    let doc = state
        .store
        .get_document(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("documento {id}")))?;
    if doc.user_id != user.id {
        return Err(Error::Forbidden);
    }
    Ok(doc)
}

#[axum::debug_handler(state = AppState)]
async fn process_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ProcessPayload>,
) -> Result<Json<ProcessResponse>> {
    let doc = owned_document(&state, &user, &payload.document_id).await?;
    let outcome = state
        .lifecycle
        .process_bounded(&doc.id, &doc.url, &doc.name, &user.id)
        .await?;

    Ok(Json(ProcessResponse {
        success: true,
        document_id: doc.id,
        outcome,
    }))
}

#[axum::debug_handler(state = AppState)]
async fn get_document_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Document>> {
    Ok(Json(owned_document(&state, &user, &id).await?))
}

#[axum::debug_handler(state = AppState)]
async fn delete_document_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.lifecycle.delete(&id, &user.id).await?;
    Ok(Json(json!({ "success": true })))
}

#[axum::debug_handler(state = AppState)]
async fn chat_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<ChatResponse>> {
    let query = payload.query.trim();
    if query.is_empty() || payload.document_ids.is_empty() {
        return Err(Error::invalid("se requieren 'query' y 'documentIds'"));
    }
    let conversation_id = parse_conversation_id(payload.conversation_id.as_deref());

    let answer = state
        .answerer
        .answer(&user.id, query, &payload.document_ids)
        .await?;

    let turn = state
        .store
        .create_chat(NewChat {
            user_id: user.id.clone(),
            conversation_id,
            query: query.to_string(),
            response: answer.response,
            document_ids: payload.document_ids,
            sources: answer.sources,
        })
        .await?;
    info!("Turno de chat {} guardado en la conversación {}", turn.id, turn.conversation_id);

    Ok(Json(ChatResponse {
        response: turn.response,
        sources: turn.sources,
        chat_id: turn.id,
        conversation_id: turn.conversation_id,
    }))
}

#[axum::debug_handler(state = AppState)]
async fn list_chats_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ChatListParams>,
) -> Result<Json<Vec<ChatTurn>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_CHAT_PAGE)
        .clamp(1, MAX_CHAT_PAGE);
    Ok(Json(state.store.list_chats(&user.id, limit).await?))
}

#[axum::debug_handler(state = AppState)]
async fn conversation_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<ChatTurn>>> {
    let conversation_id = parse_conversation_id(Some(&conversation_id))
        .ok_or_else(|| Error::not_found(format!("conversación {conversation_id}")))?;
    let turns = state.store.conversation(&user.id, &conversation_id).await?;
    if turns.is_empty() {
        return Err(Error::not_found(format!("conversación {conversation_id}")));
    }
    Ok(Json(turns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::LocalBlobStore,
        config::AppConfig,
        ingest::DocumentLifecycle,
        memory::{MemoryStore, MemoryVectorIndex},
        models::DocumentStatus,
        rag::{AnswerSettings, Answerer},
        store::MetadataStore,
        testing::{HashEmbedder, StaticCompletion},
        vector_store::VectorService,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "docchat-test-boundary";

    struct TestApp {
        router: Router,
        state: AppState,
        llm: Arc<StaticCompletion>,
        _dir: TempDir,
    }

    async fn test_app() -> TestApp {
        test_app_with(None, None).await
    }

    async fn test_app_with(
        embed_delay: Option<Duration>,
        process_timeout: Option<Duration>,
    ) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::in_memory(dir.path().to_path_buf());
        if let Some(timeout) = process_timeout {
            config.process_timeout = timeout;
        }
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(LocalBlobStore::open(&config.upload_dir).await.unwrap());
        let mut embedder = HashEmbedder::new(config.embedding_dimensions);
        if let Some(delay) = embed_delay {
            embedder = embedder.slow(delay);
        }
        let vectors = VectorService::new(
            Arc::new(embedder),
            Arc::new(MemoryVectorIndex::new()),
            config.embed_batch_size,
        );
        let llm = Arc::new(StaticCompletion::answering("Según el documento, sí."));
        let lifecycle = DocumentLifecycle::new(
            store.clone(),
            blobs,
            vectors.clone(),
            config.chunking,
            config.process_timeout,
        );
        let answerer = Answerer::new(vectors, llm.clone(), AnswerSettings::default());

        let state = AppState {
            config: Arc::new(config),
            store,
            lifecycle: Arc::new(lifecycle),
            answerer: Arc::new(answerer),
        };
        TestApp {
            router: create_router(state.clone()),
            state,
            llm,
            _dir: dir,
        }
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json = if body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&body).unwrap()
            };
            (status, json)
        }

        async fn get(&self, uri: &str, email: &str) -> (StatusCode, serde_json::Value) {
            self.send(
                Request::get(uri)
                    .header("x-user-email", email)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
        }

        async fn post_json(
            &self,
            uri: &str,
            email: &str,
            body: serde_json::Value,
        ) -> (StatusCode, serde_json::Value) {
            self.send(
                Request::post(uri)
                    .header("x-user-email", email)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        async fn upload(
            &self,
            email: &str,
            file_name: &str,
            content_type: &str,
            bytes: &[u8],
        ) -> (StatusCode, serde_json::Value) {
            let mut body = format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .into_bytes();
            body.extend_from_slice(bytes);
            body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

            self.send(
                Request::post("/api/documents/upload")
                    .header("x-user-email", email)
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
        }

        /// Espera a que el procesado en segundo plano llegue a un estado terminal.
        async fn wait_terminal(&self, email: &str, id: &str) -> serde_json::Value {
            for _ in 0..200 {
                let (_, doc) = self.get(&format!("/api/documents/{id}"), email).await;
                if doc["status"] == "ready" || doc["status"] == "error" {
                    return doc;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("el documento {id} no terminó de procesarse");
        }

        async fn ready_document(&self, email: &str, text: &str) -> String {
            let (status, doc) = self.upload(email, "notas.txt", "text/plain", text.as_bytes()).await;
            assert_eq!(status, StatusCode::CREATED);
            let id = doc["id"].as_str().unwrap().to_string();
            assert_eq!(self.wait_terminal(email, &id).await["status"], "ready");
            id
        }
    }

    #[tokio::test]
    async fn health_needs_no_identity() {
        let app = test_app().await;
        let (status, body) = app
            .send(Request::get("/api/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let app = test_app().await;
        let (status, body) = app
            .send(Request::get("/api/documents").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "unauthorized");
    }

    #[tokio::test]
    async fn upload_is_processed_in_background() {
        let app = test_app().await;
        let text = "Rust es un lenguaje de sistemas. ".repeat(60);
        let (status, doc) = app
            .upload("ana@example.com", "notas.txt", "text/plain", text.as_bytes())
            .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(doc["name"], "notas.txt");
        assert_eq!(doc["type"], "text/plain");
        assert_eq!(doc["size"], text.len());

        let id = doc["id"].as_str().unwrap();
        let doc = app.wait_terminal("ana@example.com", id).await;
        assert_eq!(doc["status"], "ready");
        assert_eq!(doc["chunkCount"], 3);

        let (_, docs) = app.get("/api/documents", "ana@example.com").await;
        assert_eq!(docs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn octet_stream_upload_falls_back_to_extension() {
        let app = test_app().await;
        let (status, doc) = app
            .upload("ana@example.com", "a.txt", "application/octet-stream", b"hola")
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(doc["type"], "text/plain");
    }

    #[tokio::test]
    async fn rejects_unsupported_uploads() {
        let app = test_app().await;

        let (status, body) = app
            .upload("ana@example.com", "foto.png", "image/png", b"\x89PNG")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "unsupported_file_type");

        // extensión válida con MIME incoherente
        let (status, _) = app
            .upload("ana@example.com", "a.txt", "application/pdf", b"hola")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, docs) = app.get("/api/documents", "ana@example.com").await;
        assert!(docs.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_endpoint_runs_inline_once() {
        let app = test_app().await;
        let user_id = app
            .state
            .store
            .sync_user(&crate::models::UserIdentity {
                email: "ana@example.com".into(),
                name: None,
                picture: None,
                subject: None,
            })
            .await
            .unwrap();
        let doc = app
            .state
            .lifecycle
            .begin_upload(&user_id, "a.txt", "text/plain", "a".repeat(2400).as_bytes())
            .await
            .unwrap();

        let (status, body) = app
            .post_json(
                "/api/documents/process",
                "intruso@example.com",
                json!({ "documentId": doc.id }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

        let (status, body) = app
            .post_json("/api/documents/process", "ana@example.com", json!({ "documentId": doc.id }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "success": true,
                "documentId": doc.id,
                "chunkCount": 3,
                "vectorCount": 3,
                "textLength": 2400,
            })
        );

        let (status, body) = app
            .post_json("/api/documents/process", "ana@example.com", json!({ "documentId": doc.id }))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["type"], "invalid_transition");
        let stored = app.state.store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn process_endpoint_is_bounded_by_the_processing_timeout() {
        let app = test_app_with(Some(Duration::from_secs(30)), Some(Duration::from_millis(50))).await;
        let user_id = app
            .state
            .store
            .sync_user(&crate::models::UserIdentity {
                email: "ana@example.com".into(),
                name: None,
                picture: None,
                subject: None,
            })
            .await
            .unwrap();
        let doc = app
            .state
            .lifecycle
            .begin_upload(&user_id, "lento.txt", "text/plain", b"contenido lento")
            .await
            .unwrap();

        let (status, body) = app
            .post_json("/api/documents/process", "ana@example.com", json!({ "documentId": doc.id }))
            .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT, "{body}");
        assert_eq!(body["error"]["type"], "processing_timed_out");

        let stored = app.state.store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Error);
        assert_eq!(stored.error.as_deref(), Some(crate::ingest::PROCESSING_TIMED_OUT));
    }

    #[tokio::test]
    async fn documents_are_private_to_their_owner() {
        let app = test_app().await;
        let id = app.ready_document("ana@example.com", "secreto").await;

        let (status, _) = app.get(&format!("/api/documents/{id}"), "luis@example.com").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let delete = |email: &str| {
            Request::delete(format!("/api/documents/{id}"))
                .header("x-user-email", email)
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = app.send(delete("luis@example.com")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app.send(delete("ana@example.com")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = app.get(&format!("/api/documents/{id}"), "ana@example.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_requires_query_and_documents() {
        let app = test_app().await;
        let (status, _) = app
            .post_json("/api/chat", "ana@example.com", json!({ "query": "hola", "documentIds": [] }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .post_json("/api/chat", "ana@example.com", json!({ "query": "  ", "documentIds": ["d"] }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(app.llm.calls(), 0);
    }

    #[tokio::test]
    async fn chat_turns_are_grouped_into_conversations() {
        let app = test_app().await;
        let id = app
            .ready_document("ana@example.com", "Rust garantiza seguridad de memoria.")
            .await;

        let (status, first) = app
            .post_json(
                "/api/chat",
                "ana@example.com",
                json!({ "query": "¿Qué garantiza Rust?", "documentIds": [id] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["response"], "Según el documento, sí.");
        assert_eq!(first["sources"][0]["documentId"], id.as_str());
        assert_eq!(first["conversationId"], first["chatId"]);

        let conversation = first["conversationId"].as_str().unwrap();
        let (_, second) = app
            .post_json(
                "/api/chat",
                "ana@example.com",
                json!({ "query": "¿Y algo más?", "documentIds": [id], "conversationId": conversation }),
            )
            .await;
        assert_eq!(second["conversationId"], conversation);
        assert_ne!(second["chatId"], first["chatId"]);

        // un id de conversación mal formado empieza una nueva
        let (_, third) = app
            .post_json(
                "/api/chat",
                "ana@example.com",
                json!({ "query": "otra", "documentIds": [id], "conversationId": "abc" }),
            )
            .await;
        assert_eq!(third["conversationId"], third["chatId"]);

        let (status, turns) = app
            .get(&format!("/api/chats/{conversation}"), "ana@example.com")
            .await;
        assert_eq!(status, StatusCode::OK);
        let turns = turns.as_array().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["query"], "¿Qué garantiza Rust?");

        let (_, recent) = app.get("/api/chats?limit=1", "ana@example.com").await;
        assert_eq!(recent.as_array().unwrap().len(), 1);

        let (status, _) = app
            .get(&format!("/api/chats/{conversation}"), "luis@example.com")
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_without_matches_answers_without_sources() {
        let app = test_app().await;
        let (status, body) = app
            .post_json(
                "/api/chat",
                "ana@example.com",
                json!({ "query": "¿algo?", "documentIds": ["inexistente"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], crate::rag::NO_RELEVANT_INFORMATION);
        assert!(body["sources"].as_array().unwrap().is_empty());
        assert_eq!(app.llm.calls(), 0);
    }
}
