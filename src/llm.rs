//! Abstracción sobre los proveedores de LLM, embeddings y rerank.
//!
//! El motor ve tres invocables opacos (`Generator`, `Embedder`,
//! `Reranker`); `LlmManager` los envuelve con el pool acotado de
//! concurrencia, tiempos máximos, reintentos con retroceso exponencial
//! y la caché opcional de respuestas. De momento se implementa OpenAI
//! vía Rig; Gemini/Ollama quedan preparados para el futuro.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{AppConfig, LlmProvider};
use crate::error::{RagError, Result};
use crate::models::ChatTurn;
use crate::storage::KvStorage;

/// Número máximo de intentos contra el generador/embedder.
const MAX_ATTEMPTS: u32 = 3;
/// Retroceso base entre reintentos.
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Opciones de una invocación del generador.
#[derive(Debug, Clone, Default)]
pub struct GenerateOpts {
    pub system: Option<String>,
    pub history: Vec<ChatTurn>,
}

/// Invocable opaco de generación de texto.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, opts: &GenerateOpts) -> Result<String>;

    /// Variante en streaming. La implementación por defecto emite la
    /// respuesta completa como un único elemento; los proveedores con
    /// soporte nativo pueden sobreescribirla.
    async fn generate_stream(
        &self,
        prompt: &str,
        opts: &GenerateOpts,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let full = self.generate(prompt, opts).await?;
        Ok(futures::stream::once(async move { Ok(full) }).boxed())
    }
}

/// Invocable opaco de embeddings. Preserva el orden; dimensión fija.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

/// Puntuación de relevancia de un documento frente a una consulta.
#[derive(Debug, Clone)]
pub struct RerankScore {
    pub index: usize,
    pub relevance_score: f32,
}

/// Invocable opaco de rerank externo.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        docs: &[String],
        top_n: Option<usize>,
    ) -> Result<Vec<RerankScore>>;
}

/// Gestor de LLMs: pool acotado, tiempos máximos, reintentos y caché.
#[derive(Clone)]
pub struct LlmManager {
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    /// Pool compartido para llamadas LLM + embeddings (`max_async`).
    pool: Arc<Semaphore>,
    cache: Option<Arc<dyn KvStorage>>,
    llm_timeout: Duration,
    embedding_timeout: Duration,
}

impl LlmManager {
    pub fn new(
        cfg: &AppConfig,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        cache: Option<Arc<dyn KvStorage>>,
    ) -> Self {
        LlmManager {
            generator,
            embedder,
            reranker,
            pool: Arc::new(Semaphore::new(cfg.max_async)),
            cache: if cfg.enable_llm_cache { cache } else { None },
            llm_timeout: Duration::from_secs(cfg.llm_timeout_secs),
            embedding_timeout: Duration::from_secs(cfg.embedding_timeout_secs),
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// Genera una respuesta con reintentos y, si está habilitada, la
    /// caché de respuestas (clave: MD5 de sistema + prompt).
    pub async fn generate(&self, prompt: &str, opts: &GenerateOpts) -> Result<String> {
        let cache_key = self.cache.as_ref().map(|_| {
            format!(
                "llm-{:x}",
                md5::compute(format!(
                    "{}|{}",
                    opts.system.as_deref().unwrap_or(""),
                    prompt
                ))
            )
        });

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get(key).await? {
                if let Some(text) = hit.get("return").and_then(|v| v.as_str()) {
                    debug!("Respuesta del LLM servida desde caché");
                    return Ok(text.to_string());
                }
            }
        }

        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BASE_BACKOFF * 2u32.pow(attempt - 1);
                warn!("Reintentando llamada al LLM en {delay:?} (intento {})", attempt + 1);
                tokio::time::sleep(delay).await;
            }
            let _permit = self.pool.acquire().await.map_err(|e| RagError::Llm {
                retries: attempt,
                cause: e.to_string(),
            })?;
            match tokio::time::timeout(
                self.llm_timeout,
                self.generator.generate(prompt, opts),
            )
            .await
            {
                Ok(Ok(text)) => {
                    if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                        cache
                            .upsert(HashMap::from([(
                                key.clone(),
                                json!({ "return": text }),
                            )]))
                            .await?;
                    }
                    return Ok(text);
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = format!("timeout tras {:?}", self.llm_timeout),
            }
        }
        Err(RagError::Llm {
            retries: MAX_ATTEMPTS,
            cause: last_err,
        })
    }

    /// Flujo de generación sin buffering. No pasa por la caché.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        opts: &GenerateOpts,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let _permit = self.pool.acquire().await.map_err(|e| RagError::Llm {
            retries: 0,
            cause: e.to_string(),
        })?;
        self.generator.generate_stream(prompt, opts).await
    }

    /// Embeddings en bloque con reintentos y tiempo máximo.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BASE_BACKOFF * 2u32.pow(attempt - 1);
                warn!("Reintentando embeddings en {delay:?} (intento {})", attempt + 1);
                tokio::time::sleep(delay).await;
            }
            let _permit = self.pool.acquire().await.map_err(|e| RagError::Embedding {
                text_count: texts.len(),
                cause: e.to_string(),
            })?;
            match tokio::time::timeout(self.embedding_timeout, self.embedder.embed(texts))
                .await
            {
                Ok(Ok(vectors)) => {
                    if vectors.len() != texts.len() {
                        return Err(RagError::Embedding {
                            text_count: texts.len(),
                            cause: format!(
                                "número de embeddings ({}) distinto al de textos",
                                vectors.len()
                            ),
                        });
                    }
                    return Ok(vectors);
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = format!("timeout tras {:?}", self.embedding_timeout),
            }
        }
        Err(RagError::Embedding {
            text_count: texts.len(),
            cause: last_err,
        })
    }

    /// Rerank externo; el llamante decide qué hacer si no hay proveedor.
    pub async fn rerank(
        &self,
        query: &str,
        docs: &[String],
        top_n: Option<usize>,
    ) -> Result<Vec<RerankScore>> {
        match &self.reranker {
            Some(reranker) => reranker.rerank(query, docs, top_n).await,
            None => Err(RagError::Configuration {
                param: "reranker",
                value: "(no configurado)".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------
// Proveedor OpenAI vía Rig
// ---------------------------------------------------------------------

/// Generador y embedder sobre la API de OpenAI usando Rig.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    chat_model: String,
    embedding_model: String,
    embedding_dim: usize,
}

impl OpenAiProvider {
    /// Construye el proveedor a partir de la configuración. Sólo OpenAI
    /// está implementado; otros proveedores añadirían ramas al `match`.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        match cfg.llm_provider {
            LlmProvider::OpenAI => Ok(OpenAiProvider {
                chat_model: cfg.llm_chat_model.clone(),
                embedding_model: cfg.llm_embedding_model.clone(),
                embedding_dim: cfg.embedding_dim,
            }),
            ref other => Err(RagError::Configuration {
                param: "llm_provider",
                value: format!("{other:?} aún no implementado"),
            }),
        }
    }

    /// Pliega el historial de conversación en el prompt. Rig no acepta
    /// turnos previos en `prompt`, así que se antepone como transcript.
    fn fold_history(prompt: &str, history: &[ChatTurn]) -> String {
        if history.is_empty() {
            return prompt.to_string();
        }
        let mut folded = String::from("---Previous Conversation---\n");
        for turn in history {
            folded.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
        folded.push('\n');
        folded.push_str(prompt);
        folded
    }
}

#[async_trait]
impl Generator for OpenAiProvider {
    async fn generate(&self, prompt: &str, opts: &GenerateOpts) -> Result<String> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let mut agent = client.agent(model_name);
        if let Some(system) = &opts.system {
            agent = agent.preamble(system);
        }
        let agent = agent.build();

        let full_prompt = Self::fold_history(prompt, &opts.history);
        agent
            .prompt(full_prompt)
            .await
            .map_err(|e| RagError::Llm {
                retries: 0,
                cause: e.to_string(),
            })
    }
}

#[async_trait]
impl Embedder for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| RagError::Embedding {
                text_count: texts.len(),
                cause: e.to_string(),
            })?;

        Ok(embeddings
            .iter()
            .map(|e| e.vec.iter().map(|&v| v as f32).collect())
            .collect())
    }

    fn dimension(&self) -> usize {
        self.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Generador que falla un número fijo de veces antes de responder.
    struct FlakyGenerator {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Generator for FlakyGenerator {
        async fn generate(&self, _prompt: &str, _opts: &GenerateOpts) -> Result<String> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(RagError::Llm {
                    retries: 0,
                    cause: "fallo transitorio".to_string(),
                });
            }
            Ok("respuesta".to_string())
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    fn manager(generator: Arc<dyn Generator>) -> LlmManager {
        let cfg = AppConfig {
            enable_llm_cache: false,
            ..AppConfig::default()
        };
        LlmManager::new(&cfg, generator, Arc::new(FixedEmbedder), None, None)
    }

    #[tokio::test(start_paused = true)]
    async fn generate_retries_transient_failures() {
        let llm = manager(Arc::new(FlakyGenerator {
            failures: AtomicU32::new(2),
        }));
        let out = llm.generate("hola", &GenerateOpts::default()).await.unwrap();
        assert_eq!(out, "respuesta");
    }

    #[tokio::test(start_paused = true)]
    async fn generate_surfaces_retry_exhaustion() {
        let llm = manager(Arc::new(FlakyGenerator {
            failures: AtomicU32::new(10),
        }));
        let err = llm
            .generate("hola", &GenerateOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Llm { retries: 3, .. }));
    }

    #[tokio::test]
    async fn embed_checks_batch_length() {
        let llm = manager(Arc::new(FlakyGenerator {
            failures: AtomicU32::new(0),
        }));
        let out = llm.embed(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(llm.embed(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn history_is_folded_into_the_prompt() {
        let folded = OpenAiProvider::fold_history(
            "pregunta",
            &[ChatTurn {
                role: "user".to_string(),
                content: "hola".to_string(),
            }],
        );
        assert!(folded.contains("user: hola"));
        assert!(folded.ends_with("pregunta"));
    }
}
