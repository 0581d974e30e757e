//! Modelos de dominio: documentos, chunks, nodos y aristas del grafo de
//! conocimiento, registros vectoriales y tipos de consulta.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::prompts::GRAPH_FIELD_SEP;

/// Estado de un documento dentro del ciclo de ingesta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Preprocessed,
    Processed,
    Failed,
}

/// Registro de estado de un documento. La clave es `doc_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub doc_id: String,
    pub content_md5: String,
    pub status: DocStatus,
    pub file_path: String,
    /// Primeros 100 caracteres del contenido normalizado.
    pub content_summary: String,
    pub content_length: usize,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl DocRecord {
    /// Crea un registro nuevo en estado `pending` a partir del contenido
    /// normalizado.
    pub fn new(doc_id: &str, content: &str, file_path: Option<&str>) -> Self {
        let now = iso_now();
        DocRecord {
            doc_id: doc_id.to_string(),
            content_md5: doc_id.trim_start_matches("doc-").to_string(),
            status: DocStatus::Pending,
            file_path: file_path.unwrap_or("unknown_source").to_string(),
            content_summary: content.chars().take(100).collect(),
            content_length: content.chars().count(),
            created_at: now.clone(),
            updated_at: now,
            chunks_count: None,
            chunk_ids: None,
            error_msg: None,
        }
    }
}

/// Un trozo de documento acotado por tokens. La clave es `chunk_id`,
/// derivada del contenido: chunks idénticos entre documentos colapsan
/// en un único registro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub content: String,
    pub tokens: usize,
    pub full_doc_id: String,
    pub chunk_order_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Atributos de un nodo entidad del grafo. La clave es `entity_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub entity_type: String,
    pub description: String,
    /// Ids de chunk contribuyentes, unidos por el separador reservado.
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Atributos de una arista (no dirigida) del grafo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    pub weight: f64,
    pub description: String,
    pub keywords: String,
    pub source_id: String,
}

/// Registro de un índice vectorial. `metadata` lleva la clave de vuelta
/// al grafo (`entity_name`, `src_id`/`tgt_id` o `doc_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Resultado de una consulta vectorial.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub record: VectorRecord,
}

impl VectorHit {
    /// Metadato de texto del registro, si existe.
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.record
            .metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Nodo devuelto por `knowledge_subgraph`.
#[derive(Debug, Clone, Serialize)]
pub struct SubgraphNode {
    pub id: String,
    pub attrs: NodeAttrs,
}

/// Arista devuelta por `knowledge_subgraph`.
#[derive(Debug, Clone, Serialize)]
pub struct SubgraphEdge {
    pub source: String,
    pub target: String,
    pub attrs: EdgeAttrs,
}

/// Subgrafo acotado devuelto por la exploración BFS.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeSubgraph {
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
    pub truncated: bool,
}

/// Estrategia de recuperación de una consulta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Local,
    Global,
    Hybrid,
    Naive,
    Mix,
    Bypass,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Naive => "naive",
            QueryMode::Mix => "mix",
            QueryMode::Bypass => "bypass",
        }
    }
}

/// Un turno previo de conversación que se reenvía al generador.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Parámetros de una consulta. Los valores por defecto reproducen la
/// configuración recomendada del motor.
#[derive(Debug, Clone)]
pub struct QueryParam {
    pub mode: QueryMode,
    pub top_k: usize,
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,
    pub cos_sim_threshold: Option<f32>,
    pub enable_rerank: bool,
    pub min_rerank_score: f32,
    pub hl_keywords: Vec<String>,
    pub ll_keywords: Vec<String>,
    pub only_need_context: bool,
    pub response_type: String,
    pub user_prompt: Option<String>,
    pub conversation_history: Vec<ChatTurn>,
}

impl Default for QueryParam {
    fn default() -> Self {
        QueryParam {
            mode: QueryMode::Mix,
            top_k: 40,
            chunk_top_k: 20,
            max_entity_tokens: 6000,
            max_relation_tokens: 8000,
            max_total_tokens: 30000,
            cos_sim_threshold: None,
            enable_rerank: false,
            min_rerank_score: 0.1,
            hl_keywords: Vec::new(),
            ll_keywords: Vec::new(),
            only_need_context: false,
            response_type: "Multiple Paragraphs".to_string(),
            user_prompt: None,
            conversation_history: Vec::new(),
        }
    }
}

/// Palabras clave elicitadas para una consulta.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryKeywords {
    #[serde(default)]
    pub high_level_keywords: Vec<String>,
    #[serde(default)]
    pub low_level_keywords: Vec<String>,
}

/// Metadatos adjuntos al resultado de una consulta.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryMetadata {
    #[serde(rename = "queryMode")]
    pub query_mode: String,
    pub keywords: QueryKeywords,
}

/// Datos crudos de recuperación que acompañan a la respuesta.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryRawData {
    pub entities: Vec<serde_json::Value>,
    pub relationships: Vec<serde_json::Value>,
    pub chunks: Vec<serde_json::Value>,
    pub references: Vec<serde_json::Value>,
    pub metadata: QueryMetadata,
}

/// Resultado completo de una consulta.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub response: String,
    pub context: String,
    pub raw_data: QueryRawData,
}

/// Desenlace de un borrado de documento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionOutcome {
    Deleted,
    NotFound,
    Fail,
}

/// Informe de un borrado con los contadores de limpieza.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionResult {
    pub outcome: DeletionOutcome,
    pub doc_id: String,
    pub message: String,
    pub chunks_removed: usize,
    pub entities_removed: usize,
    pub entities_updated: usize,
    pub relations_removed: usize,
    pub relations_updated: usize,
}

/// Marca de tiempo ISO-8601 UTC.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Id de documento: `doc-` + MD5 hex del contenido normalizado.
pub fn compute_doc_id(normalized_content: &str) -> String {
    format!("doc-{:x}", md5::compute(normalized_content.as_bytes()))
}

/// Id de chunk: `chunk-` + MD5 hex del contenido del chunk.
pub fn compute_chunk_id(content: &str) -> String {
    format!("chunk-{:x}", md5::compute(content.as_bytes()))
}

/// Divide un `source_id` almacenado en sus ids de chunk.
pub fn split_source_id(source_id: &str) -> Vec<String> {
    source_id
        .split(GRAPH_FIELD_SEP)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Une ids de chunk en un `source_id` con el separador reservado.
pub fn join_source_ids<I, S>(ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ids.into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(GRAPH_FIELD_SEP)
}

/// Clave canónica de una arista no dirigida: par ordenado lexicográficamente.
pub fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_and_chunk_ids_are_content_addressed() {
        let a = compute_doc_id("hola mundo");
        let b = compute_doc_id("hola mundo");
        let c = compute_doc_id("otro texto");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("doc-"));
        assert!(compute_chunk_id("x").starts_with("chunk-"));
    }

    #[test]
    fn source_id_round_trip() {
        let joined = join_source_ids(["chunk-1", "chunk-2"]);
        assert_eq!(split_source_id(&joined), vec!["chunk-1", "chunk-2"]);
        assert!(split_source_id("").is_empty());
    }

    #[test]
    fn canonical_pair_orders_lexicographically() {
        assert_eq!(canonical_pair("b", "a"), canonical_pair("a", "b"));
        assert_eq!(canonical_pair("a", "b"), ("a".into(), "b".into()));
    }
}
