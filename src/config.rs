//! Carga y validación de la configuración del motor (almacenamiento,
//! chunking, presupuestos de consulta y proveedores LLM).

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Proveedor de LLM soportado.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(RagError::Configuration {
                param: "llm_provider",
                value: other.to_string(),
            }),
        }
    }
}

/// Política de truncado de `source_id` al superar el límite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceIdsLimitMethod {
    /// Descarta los ids más antiguos (se quedan los más nuevos).
    Fifo,
    /// Rechaza los ids nuevos (se quedan los más antiguos).
    Keep,
}

impl SourceIdsLimitMethod {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FIFO" => Ok(Self::Fifo),
            "KEEP" => Ok(Self::Keep),
            other => Err(RagError::Configuration {
                param: "source_ids_limit_method",
                value: other.to_string(),
            }),
        }
    }
}

/// Tipos de entidad que se piden al extractor por defecto.
pub const DEFAULT_ENTITY_TYPES: [&str; 11] = [
    "person",
    "creature",
    "organization",
    "location",
    "event",
    "concept",
    "method",
    "content",
    "data",
    "artifact",
    "natural_object",
];

/// Configuración completa del motor.
#[derive(Clone, Debug)]
pub struct AppConfig {
    // --- Almacenamiento ---
    pub working_dir: String,
    pub namespace: String,
    pub kv_storage: String,
    pub vector_storage: String,
    pub graph_storage: String,
    pub doc_status_storage: String,

    // --- Chunking ---
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,

    // --- Embeddings / similitud ---
    pub embedding_dim: usize,
    pub cosine_threshold: f32,

    // --- Consulta ---
    pub top_k: usize,
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,

    // --- Extracción y fusión ---
    pub max_gleaning: usize,
    pub entity_types: Vec<String>,
    pub language: String,
    pub force_llm_summary_on_merge: usize,
    pub summary_max_tokens: usize,
    pub summary_length_recommended: usize,
    pub source_ids_limit_method: SourceIdsLimitMethod,
    pub max_source_ids_per_entity: usize,
    pub max_source_ids_per_relation: usize,

    // --- Concurrencia y tiempos ---
    pub max_async: usize,
    pub max_parallel_insert: usize,
    pub llm_timeout_secs: u64,
    pub embedding_timeout_secs: u64,

    // --- LLM ---
    pub enable_llm_cache: bool,
    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    // --- Backend bolt opcional ---
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            working_dir: "./rag_storage".to_string(),
            namespace: "default".to_string(),
            kv_storage: "json_kv".to_string(),
            vector_storage: "json_vector".to_string(),
            graph_storage: "json_graph".to_string(),
            doc_status_storage: "json_doc_status".to_string(),
            chunk_token_size: 1200,
            chunk_overlap_token_size: 100,
            embedding_dim: 1536,
            cosine_threshold: 0.2,
            top_k: 40,
            chunk_top_k: 20,
            max_entity_tokens: 6000,
            max_relation_tokens: 8000,
            max_total_tokens: 30000,
            max_gleaning: 1,
            entity_types: DEFAULT_ENTITY_TYPES.iter().map(|s| s.to_string()).collect(),
            language: "English".to_string(),
            force_llm_summary_on_merge: 8,
            summary_max_tokens: 1200,
            summary_length_recommended: 600,
            source_ids_limit_method: SourceIdsLimitMethod::Fifo,
            max_source_ids_per_entity: 300,
            max_source_ids_per_relation: 300,
            max_async: 4,
            max_parallel_insert: 2,
            llm_timeout_secs: 180,
            embedding_timeout_secs: 30,
            enable_llm_cache: true,
            llm_provider: LlmProvider::OpenAI,
            llm_embedding_model: "text-embedding-3-small".to_string(),
            llm_chat_model: "gpt-4o-mini".to_string(),
            neo4j_uri: String::new(),
            neo4j_user: String::new(),
            neo4j_password: String::new(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| RagError::Configuration {
            param: key,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si
    /// existe), partiendo de los valores por defecto.
    pub fn from_env() -> Result<Self> {
        let base = AppConfig::default();

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let limit_method_str = env::var("SOURCE_IDS_LIMIT_METHOD")
            .unwrap_or_else(|_| "FIFO".to_string());
        let source_ids_limit_method = SourceIdsLimitMethod::from_str(&limit_method_str)?;

        let entity_types = match env::var("ENTITY_TYPES") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => base.entity_types.clone(),
        };

        let cfg = AppConfig {
            working_dir: env::var("WORKING_DIR").unwrap_or(base.working_dir),
            namespace: env::var("NAMESPACE").unwrap_or(base.namespace),
            kv_storage: env::var("KV_STORAGE").unwrap_or(base.kv_storage),
            vector_storage: env::var("VECTOR_STORAGE").unwrap_or(base.vector_storage),
            graph_storage: env::var("GRAPH_STORAGE").unwrap_or(base.graph_storage),
            doc_status_storage: env::var("DOC_STATUS_STORAGE")
                .unwrap_or(base.doc_status_storage),
            chunk_token_size: env_or("CHUNK_TOKEN_SIZE", base.chunk_token_size)?,
            chunk_overlap_token_size: env_or(
                "CHUNK_OVERLAP_TOKEN_SIZE",
                base.chunk_overlap_token_size,
            )?,
            embedding_dim: env_or("EMBEDDING_DIM", base.embedding_dim)?,
            cosine_threshold: env_or("COSINE_THRESHOLD", base.cosine_threshold)?,
            top_k: env_or("TOP_K", base.top_k)?,
            chunk_top_k: env_or("CHUNK_TOP_K", base.chunk_top_k)?,
            max_entity_tokens: env_or("MAX_ENTITY_TOKENS", base.max_entity_tokens)?,
            max_relation_tokens: env_or("MAX_RELATION_TOKENS", base.max_relation_tokens)?,
            max_total_tokens: env_or("MAX_TOTAL_TOKENS", base.max_total_tokens)?,
            max_gleaning: env_or("MAX_GLEANING", base.max_gleaning)?,
            entity_types,
            language: env::var("SUMMARY_LANGUAGE").unwrap_or(base.language),
            force_llm_summary_on_merge: env_or(
                "FORCE_LLM_SUMMARY_ON_MERGE",
                base.force_llm_summary_on_merge,
            )?,
            summary_max_tokens: env_or("SUMMARY_MAX_TOKENS", base.summary_max_tokens)?,
            summary_length_recommended: env_or(
                "SUMMARY_LENGTH_RECOMMENDED",
                base.summary_length_recommended,
            )?,
            source_ids_limit_method,
            max_source_ids_per_entity: env_or(
                "MAX_SOURCE_IDS_PER_ENTITY",
                base.max_source_ids_per_entity,
            )?,
            max_source_ids_per_relation: env_or(
                "MAX_SOURCE_IDS_PER_RELATION",
                base.max_source_ids_per_relation,
            )?,
            max_async: env_or("MAX_ASYNC", base.max_async)?,
            max_parallel_insert: env_or("MAX_PARALLEL_INSERT", base.max_parallel_insert)?,
            llm_timeout_secs: env_or("LLM_TIMEOUT_SECS", base.llm_timeout_secs)?,
            embedding_timeout_secs: env_or(
                "EMBEDDING_TIMEOUT_SECS",
                base.embedding_timeout_secs,
            )?,
            enable_llm_cache: env_or("ENABLE_LLM_CACHE", base.enable_llm_cache)?,
            llm_provider,
            llm_embedding_model: env::var("LLM_EMBEDDING_MODEL")
                .unwrap_or(base.llm_embedding_model),
            llm_chat_model: env::var("LLM_CHAT_MODEL").unwrap_or(base.llm_chat_model),
            neo4j_uri: env::var("NEO4J_URI").unwrap_or_default(),
            neo4j_user: env::var("NEO4J_USER").unwrap_or_default(),
            neo4j_password: env::var("NEO4J_PASSWORD").unwrap_or_default(),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Comprueba los invariantes entre parámetros. Fatal en construcción.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_token_size == 0 {
            return Err(RagError::Configuration {
                param: "chunk_token_size",
                value: "0".to_string(),
            });
        }
        if self.chunk_overlap_token_size >= self.chunk_token_size {
            return Err(RagError::Configuration {
                param: "chunk_overlap_token_size",
                value: format!(
                    "{} (debe ser menor que chunk_token_size={})",
                    self.chunk_overlap_token_size, self.chunk_token_size
                ),
            });
        }
        if self.embedding_dim == 0 {
            return Err(RagError::Configuration {
                param: "embedding_dim",
                value: "0".to_string(),
            });
        }
        if self.max_async == 0 {
            return Err(RagError::Configuration {
                param: "max_async",
                value: "0".to_string(),
            });
        }
        if self.max_parallel_insert == 0 {
            return Err(RagError::Configuration {
                param: "max_parallel_insert",
                value: "0".to_string(),
            });
        }
        if self.entity_types.is_empty() {
            return Err(RagError::Configuration {
                param: "entity_types",
                value: "[]".to_string(),
            });
        }
        if self.graph_storage == "neo4j_graph" && self.neo4j_uri.is_empty() {
            return Err(RagError::Configuration {
                param: "neo4j_uri",
                value: "(vacío)".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
        assert_eq!(AppConfig::default().entity_types.len(), 11);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let cfg = AppConfig {
            chunk_token_size: 100,
            chunk_overlap_token_size: 100,
            ..AppConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(RagError::Configuration { param: "chunk_overlap_token_size", .. })
        ));
    }

    #[test]
    fn limit_method_parses_both_policies() {
        assert_eq!(
            SourceIdsLimitMethod::from_str("fifo").unwrap(),
            SourceIdsLimitMethod::Fifo
        );
        assert_eq!(
            SourceIdsLimitMethod::from_str("KEEP").unwrap(),
            SourceIdsLimitMethod::Keep
        );
        assert!(SourceIdsLimitMethod::from_str("LRU").is_err());
    }
}
