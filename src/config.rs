//! Carga y gestión de configuración de la aplicación.

use anyhow::{anyhow, Result};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::chunker::ChunkingConfig;

/// Dónde viven metadatos y vectores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Neo4j,
    Memory,
}

impl StorageBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(Self::Neo4j),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de almacenamiento no soportado: {other}")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Neo4j => "neo4j",
            Self::Memory => "memory",
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub storage_backend: StorageBackend,

    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    pub llm_embedding_model: String,
    pub embedding_dimensions: usize,
    pub llm_chat_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: u64,

    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,

    pub chunking: ChunkingConfig,
    pub embed_batch_size: usize,
    pub top_k: usize,

    pub process_timeout: Duration,
    pub answer_timeout: Duration,
    pub stale_sweep_interval: Duration,
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Valor inválido para {name} ('{raw}'): {e}")),
        _ => Ok(default),
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| anyhow!("Falta {name} en el entorno"))
}

fn default_upload_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("docchat")
        .join("uploads")
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let storage_backend =
            StorageBackend::from_str(&env::var("STORAGE_BACKEND").unwrap_or_else(|_| "neo4j".into()))?;

        let (neo4j_uri, neo4j_user, neo4j_password) = match storage_backend {
            StorageBackend::Neo4j => (
                required("NEO4J_URI")?,
                required("NEO4J_USER")?,
                required("NEO4J_PASSWORD")?,
            ),
            StorageBackend::Memory => Default::default(),
        };

        let chunking = ChunkingConfig {
            size: var_or("CHUNK_SIZE", 1000)?,
            overlap: var_or("CHUNK_OVERLAP", 200)?,
        };
        if chunking.size == 0 {
            return Err(anyhow!("CHUNK_SIZE debe ser mayor que 0"));
        }

        let upload_dir = match env::var("UPLOAD_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_upload_dir(),
        };

        Ok(Self {
            server_addr: env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string()),
            storage_backend,
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            llm_embedding_model: env::var("LLM_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            embedding_dimensions: var_or("EMBEDDING_DIMENSIONS", 768)?,
            llm_chat_model: env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_temperature: var_or("LLM_TEMPERATURE", 0.7)?,
            llm_max_tokens: var_or("LLM_MAX_TOKENS", 1000)?,
            upload_dir,
            max_upload_bytes: var_or("MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            chunking,
            embed_batch_size: var_or("EMBED_BATCH_SIZE", 10)?,
            top_k: var_or("TOP_K", 5)?,
            process_timeout: Duration::from_secs(var_or("PROCESS_TIMEOUT_SECS", 300)?),
            answer_timeout: Duration::from_secs(var_or("ANSWER_TIMEOUT_SECS", 60)?),
            stale_sweep_interval: Duration::from_secs(var_or("STALE_SWEEP_INTERVAL_SECS", 600)?),
        })
    }
}

#[cfg(test)]
impl AppConfig {
    /// Valores por defecto con backend en memoria y ficheros bajo `upload_dir`.
    pub fn in_memory(upload_dir: PathBuf) -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            storage_backend: StorageBackend::Memory,
            neo4j_uri: String::new(),
            neo4j_user: String::new(),
            neo4j_password: String::new(),
            llm_embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 16,
            llm_chat_model: "gpt-4o-mini".to_string(),
            llm_temperature: 0.7,
            llm_max_tokens: 1000,
            upload_dir,
            max_upload_bytes: 10 * 1024 * 1024,
            chunking: ChunkingConfig::default(),
            embed_batch_size: 10,
            top_k: 5,
            process_timeout: Duration::from_secs(300),
            answer_timeout: Duration::from_secs(60),
            stale_sweep_interval: Duration::from_secs(600),
        }
    }
}
