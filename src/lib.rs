//! Motor de recuperación aumentada con grafo de conocimiento.
//!
//! Los documentos se ingieren una vez: se trocean, el LLM extrae
//! entidades y relaciones, y éstas se fusionan en un grafo persistente
//! con índices vectoriales duales. Las consultas combinan vecindario de
//! grafo y similitud vectorial, ensamblan un contexto acotado por
//! tokens y lo despachan al modelo generador.

pub mod chunker;
pub mod config;
pub mod delete;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod merge;
pub mod models;
pub mod prompts;
pub mod rag;
pub mod storage;
pub mod tokenizer;

pub use config::AppConfig;
pub use delete::DeleteOptions;
pub use engine::{CancelFlag, RagEngine};
pub use error::{RagError, Result};
pub use models::{QueryMode, QueryParam, QueryResult};
