use std::sync::Arc;

use crate::{config::AppConfig, ingest::DocumentLifecycle, rag::Answerer, store::MetadataStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn MetadataStore>,
    pub lifecycle: Arc<DocumentLifecycle>,
    pub answerer: Arc<Answerer>,
}
