//! Consulta RAG sobre el índice vectorial del usuario.
//!
//! Flujo:
//!   1. Búsqueda vectorial en `user-{userId}` filtrada por los documentos elegidos.
//!   2. Sin coincidencias: respuesta fija, sin fuentes (no es un error).
//!   3. Contexto = extractos en orden de ranking separados por `---`.
//!   4. El LLM responde sólo con ese contexto.
//!   5. Se devuelven las fuentes con el extracto recortado a 200 caracteres.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::llm::CompletionProvider;
use crate::models::{Answer, SourceCitation, VectorMatch};
use crate::vector_store::{truncate_chars, VectorService};

pub const NO_RELEVANT_INFORMATION: &str =
    "No se encontró información relevante en los documentos para responder a esta pregunta.";

pub const CONTEXT_DELIMITER: &str = "\n\n---\n\n";

const SOURCE_EXCERPT_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = r#"
Eres un asistente experto que responde preguntas basándose únicamente en el contexto de documentos suministrado.

Instrucciones:
1. Responde SÓLO con la información del contexto.
2. Si no encuentras información relevante, dilo claramente.
3. Cita las fuentes concretas cuando sea apropiado.
4. Sé conciso pero informativo.
5. Si la información es incompleta, indica qué falta.
"#;

#[derive(Debug, Clone, Copy)]
pub struct AnswerSettings {
    pub top_k: usize,
    pub temperature: f64,
    pub max_tokens: u64,
    pub timeout: Duration,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            temperature: 0.7,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct Answerer {
    vectors: VectorService,
    llm: Arc<dyn CompletionProvider>,
    settings: AnswerSettings,
}

/// Concatena los extractos no vacíos en orden de ranking.
pub fn build_context(matches: &[VectorMatch]) -> String {
    matches
        .iter()
        .map(|m| m.metadata.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(CONTEXT_DELIMITER)
}

pub fn citations(matches: &[VectorMatch]) -> Vec<SourceCitation> {
    matches
        .iter()
        .map(|m| SourceCitation {
            document_id: m.metadata.document_id.clone(),
            chunk_index: m.metadata.chunk_index,
            score: m.score,
            text: truncate_chars(&m.metadata.text, SOURCE_EXCERPT_CHARS),
        })
        .collect()
}

impl Answerer {
    pub fn new(
        vectors: VectorService,
        llm: Arc<dyn CompletionProvider>,
        settings: AnswerSettings,
    ) -> Self {
        Self {
            vectors,
            llm,
            settings,
        }
    }

    /// Cualquier fallo (embedding, búsqueda, generación o tiempo agotado) se
    /// devuelve como `AnswerGenerationFailed`; nunca hay respuesta parcial.
    pub async fn answer(
        &self,
        user_id: &str,
        question: &str,
        document_ids: &[String],
    ) -> Result<Answer> {
        let outcome = tokio::time::timeout(
            self.settings.timeout,
            self.try_answer(user_id, question, document_ids),
        )
        .await;

        match outcome {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(Error::AnswerGenerationFailed(msg))) => Err(Error::AnswerGenerationFailed(msg)),
            Ok(Err(err)) => {
                warn!("Consulta RAG fallida para el usuario {user_id}: {err}");
                Err(Error::AnswerGenerationFailed(err.to_string()))
            }
            Err(_) => {
                warn!("Consulta RAG agotó el tiempo ({:?})", self.settings.timeout);
                Err(Error::AnswerGenerationFailed(
                    "tiempo de espera agotado".to_string(),
                ))
            }
        }
    }

    async fn try_answer(
        &self,
        user_id: &str,
        question: &str,
        document_ids: &[String],
    ) -> Result<Answer> {
        let matches = self
            .vectors
            .search(user_id, question, document_ids, self.settings.top_k)
            .await?;

        if matches.is_empty() {
            info!("Sin coincidencias para la consulta en {} documentos", document_ids.len());
            return Ok(Answer {
                response: NO_RELEVANT_INFORMATION.to_string(),
                sources: Vec::new(),
            });
        }

        let context = build_context(&matches);
        let user_prompt = format!("Contexto de los documentos:\n{context}\n\nPregunta: {question}");

        let response = self
            .llm
            .complete(
                SYSTEM_PROMPT,
                &user_prompt,
                self.settings.temperature,
                self.settings.max_tokens,
            )
            .await?;

        info!("Respuesta generada con {} fuentes", matches.len());
        Ok(Answer {
            response,
            sources: citations(&matches),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryVectorIndex;
    use crate::models::VectorMetadata;
    use crate::testing::{HashEmbedder, StaticCompletion};

    fn vector_match(doc: &str, i: usize, text: &str, score: f64) -> VectorMatch {
        VectorMatch {
            id: format!("{doc}_chunk_{i}"),
            score,
            metadata: VectorMetadata {
                document_id: doc.into(),
                chunk_index: i,
                text: text.into(),
                chunk_count: 3,
                file_name: "a.txt".into(),
            },
        }
    }

    async fn indexed(
        llm: Arc<StaticCompletion>,
        settings: AnswerSettings,
    ) -> (Answerer, Arc<HashEmbedder>) {
        let embedder = Arc::new(HashEmbedder::new(16));
        let vectors = VectorService::new(embedder.clone(), Arc::new(MemoryVectorIndex::new()), 10);
        let chunks = vec![
            "Rust garantiza seguridad de memoria sin recolector.".to_string(),
            "x".repeat(600),
        ];
        vectors.upsert_chunks("u1", "doc1", &chunks, "rust.txt").await.unwrap();
        (Answerer::new(vectors, llm, settings), embedder)
    }

    #[test]
    fn context_joins_ranked_excerpts_with_delimiter() {
        let matches = vec![
            vector_match("d", 2, "segundo", 0.9),
            vector_match("d", 0, "", 0.8),
            vector_match("d", 1, "primero", 0.7),
        ];
        assert_eq!(build_context(&matches), "segundo\n\n---\n\nprimero");
    }

    #[test]
    fn citations_truncate_excerpts_to_200_chars() {
        let long = "ñ".repeat(500);
        let sources = citations(&[vector_match("d", 4, &long, 0.5)]);
        assert_eq!(sources[0].text.chars().count(), 200);
        assert_eq!(sources[0].chunk_index, 4);
        assert_eq!(sources[0].document_id, "d");
        assert_eq!(sources[0].score, 0.5);
    }

    #[tokio::test]
    async fn no_matches_is_a_normal_answer() {
        let llm = Arc::new(StaticCompletion::answering("no debería llamarse"));
        let (answerer, _) = indexed(llm.clone(), AnswerSettings::default()).await;

        let answer = answerer
            .answer("u1", "¿qué es Rust?", &["otro-doc".to_string()])
            .await
            .unwrap();
        assert_eq!(answer.response, NO_RELEVANT_INFORMATION);
        assert!(answer.sources.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn grounds_the_generation_on_retrieved_context() {
        let llm = Arc::new(StaticCompletion::answering("Rust es seguro [rust.txt]"));
        let (answerer, _) = indexed(llm.clone(), AnswerSettings::default()).await;

        let answer = answerer
            .answer("u1", "¿Qué garantiza Rust?", &["doc1".to_string()])
            .await
            .unwrap();

        assert_eq!(answer.response, "Rust es seguro [rust.txt]");
        assert_eq!(answer.sources.len(), 2);
        assert!(answer.sources.iter().all(|s| s.text.chars().count() <= 200));

        let prompts = llm.prompts.lock().unwrap();
        let (system, user, temperature, max_tokens) = &prompts[0];
        assert!(system.contains("únicamente en el contexto"));
        assert!(user.contains("seguridad de memoria"));
        assert!(user.contains(CONTEXT_DELIMITER));
        assert!(user.ends_with("Pregunta: ¿Qué garantiza Rust?"));
        assert_eq!((*temperature, *max_tokens), (0.7, 1000));
    }

    #[tokio::test]
    async fn generation_failure_is_answer_generation_failed() {
        let (answerer, _) =
            indexed(Arc::new(StaticCompletion::failing()), AnswerSettings::default()).await;
        let err = answerer
            .answer("u1", "pregunta", &["doc1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AnswerGenerationFailed(_)));
    }

    #[tokio::test]
    async fn embedding_failure_is_answer_generation_failed() {
        let embedder = Arc::new(HashEmbedder::new(16).failing_on("pregunta"));
        let vectors = VectorService::new(embedder, Arc::new(MemoryVectorIndex::new()), 10);
        let answerer = Answerer::new(
            vectors,
            Arc::new(StaticCompletion::answering("x")),
            AnswerSettings::default(),
        );
        let err = answerer
            .answer("u1", "pregunta", &["doc1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AnswerGenerationFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generation_times_out() {
        let llm = Arc::new(StaticCompletion::answering("tarde").slow(Duration::from_secs(120)));
        let settings = AnswerSettings {
            timeout: Duration::from_secs(5),
            ..AnswerSettings::default()
        };
        let (answerer, _) = indexed(llm, settings).await;
        let err = answerer
            .answer("u1", "Rust", &["doc1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AnswerGenerationFailed(_)));
    }
}
