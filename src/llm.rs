//! Abstracción sobre Rig para embeddings y generación de texto.
//!
//! El resto del servicio sólo conoce los traits [`EmbeddingProvider`] y
//! [`CompletionProvider`]; `LlmManager` los implementa con OpenAI.

use async_trait::async_trait;
use rig::client::{CompletionClient as _, EmbeddingsClient as _};
use rig::completion::Prompt as _;
use rig::embeddings::EmbeddingModel as _;
use rig::providers::openai;

use crate::config::AppConfig;
use crate::error::{Error, Result};

/// Capacidad externa: texto → vector de dimensión fija.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f64>>;
}

/// Capacidad externa: prompt de sistema + prompt de usuario → texto.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_tokens: u64,
    ) -> Result<String>;
}

/// Gestor de LLMs y embeddings.
#[derive(Clone)]
pub struct LlmManager {
    client: openai::Client,
    embedding_model: String,
    dimensions: usize,
    chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración; el cliente se crea una sola vez.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        // `from_env` entra en pánico sin clave: se comprueba antes.
        if std::env::var("OPENAI_API_KEY").map_or(true, |k| k.is_empty()) {
            anyhow::bail!("Falta OPENAI_API_KEY en el entorno");
        }
        Ok(Self {
            client: openai::Client::from_env(),
            embedding_model: cfg.llm_embedding_model.clone(),
            dimensions: cfg.embedding_dimensions,
            chat_model: cfg.llm_chat_model.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LlmManager {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let model = self
            .client
            .embedding_model_with_ndims(&self.embedding_model, self.dimensions);
        let embedding = model.embed_text(text).await.map_err(Error::index)?;
        Ok(embedding.vec)
    }
}

#[async_trait]
impl CompletionProvider for LlmManager {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_tokens: u64,
    ) -> Result<String> {
        let agent = self
            .client
            .agent(&self.chat_model)
            .preamble(system_prompt)
            .temperature(temperature)
            .max_tokens(max_tokens)
            .build();

        agent
            .prompt(user_prompt)
            .await
            .map_err(|e| Error::AnswerGenerationFailed(e.to_string()))
    }
}
