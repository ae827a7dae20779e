//! Dobles de prueba para las capacidades externas.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::llm::{CompletionProvider, EmbeddingProvider};

/// Embedding determinista: histograma de caracteres en `dims` cubetas.
pub struct HashEmbedder {
    dims: usize,
    reported_dims: usize,
    fail_on: Option<String>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            reported_dims: dims,
            fail_on: None,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Declara una dimensión distinta de la que realmente produce.
    pub fn reporting_dimensions(mut self, dims: usize) -> Self {
        self.reported_dims = dims;
        self
    }

    /// Falla con cualquier texto que contenga `needle`.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    /// Cada llamada tarda `delay` antes de responder.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.reported_dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(Error::index("proveedor de embeddings caído"));
            }
        }

        let mut vector = vec![0.0; self.dims];
        for c in text.chars() {
            vector[c as usize % self.dims] += 1.0;
        }
        Ok(vector)
    }
}

/// Generador con respuesta fija que registra los prompts recibidos.
pub struct StaticCompletion {
    response: Option<String>,
    delay: Option<Duration>,
    pub prompts: Mutex<Vec<(String, String, f64, u64)>>,
}

impl StaticCompletion {
    pub fn answering(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            response: None,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for StaticCompletion {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_tokens: u64,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push((
            system_prompt.to_string(),
            user_prompt.to_string(),
            temperature,
            max_tokens,
        ));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response
            .clone()
            .ok_or_else(|| Error::AnswerGenerationFailed("modelo no disponible".into()))
    }
}
