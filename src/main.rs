// Módulos de la aplicación
mod api;
mod app_state;
mod auth;
mod blob;
mod chunker;
mod config;
mod error;
mod extract;
mod ingest;
mod llm;
mod memory;
mod models;
mod neo4j_client;
mod rag;
mod store;
mod vector_store;

#[cfg(test)]
mod testing;

use crate::{
    app_state::AppState,
    blob::LocalBlobStore,
    config::{AppConfig, StorageBackend},
    ingest::DocumentLifecycle,
    llm::LlmManager,
    memory::{MemoryStore, MemoryVectorIndex},
    rag::{AnswerSettings, Answerer},
    store::{MetadataStore, Neo4jStore},
    vector_store::{Neo4jVectorIndex, VectorIndex, VectorService},
};
use anyhow::Result;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Construye metadatos e índice vectorial según el backend configurado.
async fn open_storage(
    cfg: &AppConfig,
) -> Result<(Arc<dyn MetadataStore>, Arc<dyn VectorIndex>)> {
    match cfg.storage_backend {
        StorageBackend::Neo4j => {
            let graph = neo4j_client::connect_from_config(cfg).await?;
            neo4j_client::ensure_schema(&graph, cfg.embedding_dimensions).await?;
            let graph = Arc::new(graph);
            let store: Arc<dyn MetadataStore> = Arc::new(Neo4jStore::new(graph.clone()));
            let index: Arc<dyn VectorIndex> = Arc::new(Neo4jVectorIndex::new(graph));
            Ok((store, index))
        }
        StorageBackend::Memory => {
            info!("Usando almacenamiento en memoria: los datos no persisten.");
            let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
            let index: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::new());
            Ok((store, index))
        }
    }
}

/// Barrido de documentos atascados al arrancar y después periódicamente.
fn spawn_stale_sweep(lifecycle: Arc<DocumentLifecycle>, cfg: &AppConfig) {
    let interval = cfg.stale_sweep_interval;
    let max_age = cfg.process_timeout;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = lifecycle.sweep_stale(max_age).await {
                error!("Error en el barrido de documentos atascados: {err}");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env()?;
    info!("Backend de almacenamiento: {}", cfg.storage_backend.name());

    // 3. Almacenes (Neo4j o memoria) y ficheros subidos
    let (store, index) = open_storage(&cfg).await?;
    let blobs = Arc::new(LocalBlobStore::open(&cfg.upload_dir).await?);
    info!("Ficheros subidos en {}", cfg.upload_dir.display());

    // 4. Inicializar gestor de LLMs
    let llm_manager = Arc::new(LlmManager::from_config(&cfg)?);

    // 5. Servicios del dominio
    let vectors = VectorService::new(llm_manager.clone(), index, cfg.embed_batch_size);
    let lifecycle = Arc::new(DocumentLifecycle::new(
        store.clone(),
        blobs,
        vectors.clone(),
        cfg.chunking,
        cfg.process_timeout,
    ));
    let answerer = Arc::new(Answerer::new(
        vectors,
        llm_manager,
        AnswerSettings {
            top_k: cfg.top_k,
            temperature: cfg.llm_temperature,
            max_tokens: cfg.llm_max_tokens,
            timeout: cfg.answer_timeout,
        },
    ));
    spawn_stale_sweep(lifecycle.clone(), &cfg);

    // 6. Estado compartido y router de la API
    let app_state = AppState {
        config: Arc::new(cfg),
        store,
        lifecycle,
        answerer,
    };
    let app = api::create_router(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
