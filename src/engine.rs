//! Núcleo del motor: construcción de los almacenes y del gestor LLM a
//! partir de la configuración, y la API pública de ingesta, consulta y
//! borrado. Sin estado global: todo se inyecta en la construcción.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use crate::config::AppConfig;
use crate::error::Result;
use crate::extract::Extractor;
use crate::ingest;
use crate::llm::{Embedder, Generator, LlmManager, OpenAiProvider, Reranker};
use crate::merge::{KeyedLocks, MergeConfig, Merger};
use crate::models::{
    DeletionResult, DocRecord, KnowledgeSubgraph, QueryParam, QueryResult,
};
use crate::rag;
use crate::storage::{DocStatusStorage, GraphStorage, StorageSet};
use crate::tokenizer::{SharedTokenizer, TiktokenTokenizer};
use crate::{delete, delete::DeleteOptions};

/// Señal de cancelación cooperativa. El paso en vuelo termina; el
/// pipeline comprueba la señal entre pasos.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Motor RAG aumentado con grafo de conocimiento.
pub struct RagEngine {
    pub cfg: AppConfig,
    pub(crate) tokenizer: SharedTokenizer,
    pub(crate) llm: LlmManager,
    pub stores: StorageSet,
    pub(crate) merger: Merger,
    pub(crate) extractor: Extractor,
    /// Acota los pipelines de documento concurrentes (`max_parallel_insert`).
    pub(crate) insert_pool: Arc<Semaphore>,
}

impl RagEngine {
    /// Construye el motor con invocables explícitos. Es el constructor
    /// que usan las pruebas con stubs deterministas.
    pub async fn with_components(
        cfg: AppConfig,
        tokenizer: SharedTokenizer,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Result<Self> {
        cfg.validate()?;
        let stores = StorageSet::from_config(&cfg, Arc::clone(&embedder)).await?;
        let llm = LlmManager::new(
            &cfg,
            generator,
            embedder,
            reranker,
            Some(Arc::clone(&stores.llm_cache_kv)),
        );
        let locks = Arc::new(KeyedLocks::default());
        let merger = Merger::new(
            Arc::clone(&stores.graph),
            Arc::clone(&stores.entities_vdb),
            Arc::clone(&stores.relations_vdb),
            Arc::clone(&stores.entities_kv),
            Arc::clone(&stores.relations_kv),
            llm.clone(),
            Arc::clone(&tokenizer),
            locks,
            MergeConfig::from_app(&cfg),
        );
        let extractor = Extractor::new(&cfg, llm.clone());
        let insert_pool = Arc::new(Semaphore::new(cfg.max_parallel_insert));

        info!(
            "Motor inicializado (namespace '{}', dir '{}')",
            cfg.namespace, cfg.working_dir
        );
        Ok(RagEngine {
            cfg,
            tokenizer,
            llm,
            stores,
            merger,
            extractor,
            insert_pool,
        })
    }

    /// Construye el motor con el proveedor OpenAI de la configuración y
    /// el tokenizador BPE por defecto.
    pub async fn from_config(cfg: AppConfig) -> Result<Self> {
        let provider = Arc::new(OpenAiProvider::from_config(&cfg)?);
        let tokenizer: SharedTokenizer = Arc::new(TiktokenTokenizer::new()?);
        let generator: Arc<dyn Generator> = provider.clone();
        let embedder: Arc<dyn Embedder> = provider;
        Self::with_components(cfg, tokenizer, generator, embedder, None).await
    }

    /// Ingesta un documento. Devuelve su `doc_id`; si el documento ya
    /// está en estado `processed` la llamada es un no-op.
    pub async fn insert(&self, content: &str, file_path: Option<&str>) -> Result<String> {
        ingest::ingest_document(self, content, file_path, &CancelFlag::new()).await
    }

    /// Variante de `insert` con señal de cancelación externa.
    pub async fn insert_with_cancel(
        &self,
        content: &str,
        file_path: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<String> {
        ingest::ingest_document(self, content, file_path, cancel).await
    }

    /// Ingesta un lote de documentos con `max_parallel_insert` pipelines
    /// concurrentes. Los fallos por documento no detienen el lote.
    pub async fn insert_batch(
        &self,
        docs: Vec<(String, Option<String>)>,
    ) -> Vec<Result<String>> {
        ingest::ingest_batch(self, docs, &CancelFlag::new()).await
    }

    /// Lanza una consulta con la estrategia indicada en `param.mode`.
    pub async fn query(&self, query: &str, param: QueryParam) -> Result<QueryResult> {
        rag::rag_query(self, query, param, &CancelFlag::new()).await
    }

    /// Variante de `query` con señal de cancelación externa.
    pub async fn query_with_cancel(
        &self,
        query: &str,
        param: QueryParam,
        cancel: &CancelFlag,
    ) -> Result<QueryResult> {
        rag::rag_query(self, query, param, cancel).await
    }

    /// Borra un documento y limpia huérfanos en grafo e índices.
    pub async fn delete_document(
        &self,
        doc_id: &str,
        opts: DeleteOptions,
    ) -> Result<DeletionResult> {
        delete::delete_document(self, doc_id, opts).await
    }

    /// Estado registrado de un documento.
    pub async fn doc_status(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        self.stores.doc_status.get_doc(doc_id).await
    }

    /// Subgrafo de conocimiento alrededor de una etiqueta (`*` = todo).
    pub async fn knowledge_subgraph(
        &self,
        label_filter: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<KnowledgeSubgraph> {
        self.stores
            .graph
            .knowledge_subgraph(label_filter, max_depth, max_nodes)
            .await
    }

    /// Barrera de durabilidad sobre todos los almacenes.
    pub async fn commit(&self) -> Result<()> {
        self.stores.commit_all().await
    }
}
