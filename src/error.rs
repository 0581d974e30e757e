//! Taxonomía de errores del motor. Cada variante lleva el contexto
//! (backend, operación, recuento de reintentos) necesario para decidir
//! la política de propagación en los pipelines.

use thiserror::Error;

/// Error principal del motor RAG.
#[derive(Debug, Error)]
pub enum RagError {
    /// Un segmento supera el presupuesto de tokens en modo separador-estricto.
    #[error("segmento de {tokens} tokens supera el límite de {limit}")]
    ChunkTokenLimit { tokens: usize, limit: usize },

    /// Fallo de un backend de almacenamiento en una operación concreta.
    #[error("almacenamiento [{backend}/{op}]: {cause}")]
    Storage {
        backend: &'static str,
        op: &'static str,
        cause: String,
    },

    /// El generador agotó los reintentos.
    #[error("LLM tras {retries} reintentos: {cause}")]
    Llm { retries: u32, cause: String },

    /// El servicio de embeddings falló para un lote de textos.
    #[error("embeddings ({text_count} textos): {cause}")]
    Embedding { text_count: usize, cause: String },

    /// La extracción de un chunk falló; el documento continúa sin él.
    #[error("extracción en el chunk {chunk_id}: {cause}")]
    Extraction { chunk_id: String, cause: String },

    /// Parámetro de configuración inválido. Fatal en construcción.
    #[error("configuración inválida: {param} = {value}")]
    Configuration { param: &'static str, value: String },

    /// Recurso inexistente; esperado durante el borrado.
    #[error("{resource_type} no encontrado: {resource_id}")]
    NotFound {
        resource_type: &'static str,
        resource_id: String,
    },

    /// Operación cancelada por señal externa. Distinguible de ausencia de datos.
    #[error("operación cancelada")]
    Cancelled,
}

impl RagError {
    /// Constructor abreviado para errores de almacenamiento.
    pub fn storage(
        backend: &'static str,
        op: &'static str,
        cause: impl std::fmt::Display,
    ) -> Self {
        RagError::Storage {
            backend,
            op,
            cause: cause.to_string(),
        }
    }
}

/// Alias de resultado usado en todo el motor.
pub type Result<T> = std::result::Result<T, RagError>;
