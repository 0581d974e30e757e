//! Fusión idempotente de la salida del extractor en el grafo y en los
//! índices vectoriales, con serialización por clave (nombre de entidad o
//! par de extremos) y contabilidad de procedencia (`source_id`).

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::{AppConfig, SourceIdsLimitMethod};
use crate::error::Result;
use crate::extract::{ExtractedEntity, ExtractedRelation, GroupedExtractions};
use crate::llm::{GenerateOpts, LlmManager};
use crate::models::{
    join_source_ids, split_source_id, EdgeAttrs, NodeAttrs, VectorRecord,
};
use crate::prompts::{self, render};
use crate::storage::{GraphStorage, KvStorage, VectorStorage};
use crate::tokenizer::SharedTokenizer;

/// Registro de cerrojos por clave. Las fusiones sobre la misma entidad
/// o la misma arista se serializan; es la única sección crítica del
/// motor frente a carreras de datos.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Une ids de procedencia existentes y nuevos, deduplicados y truncados
/// según la política configurada: `FIFO` descarta los más antiguos,
/// `KEEP` rechaza los más nuevos.
pub fn merge_source_ids(
    existing: &str,
    new_ids: &[String],
    limit: usize,
    method: SourceIdsLimitMethod,
) -> String {
    let mut ids = split_source_id(existing);
    for id in new_ids {
        if !ids.iter().any(|x| x == id) {
            ids.push(id.clone());
        }
    }
    if ids.len() > limit {
        match method {
            SourceIdsLimitMethod::Fifo => {
                let drop = ids.len() - limit;
                ids.drain(..drop);
            }
            SourceIdsLimitMethod::Keep => ids.truncate(limit),
        }
    }
    join_source_ids(ids)
}

/// Deduplica por coincidencia exacta tras recortar espacios, conservando
/// el orden de primera aparición.
fn dedup_trimmed(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for value in values {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() && !seen.iter().any(|s| s == &trimmed) {
            seen.push(trimmed);
        }
    }
    seen
}

/// Combina la descripción almacenada con la nueva. Las piezas se ordenan
/// para que el resultado no dependa del orden de ingesta de documentos.
fn combine_descriptions(existing: &str, incoming: &str) -> String {
    let mut pieces = dedup_trimmed([existing.to_string(), incoming.to_string()]);
    pieces.sort();
    pieces.join(" ")
}

/// Unión de palabras clave separadas por comas, ordenada y sin duplicados.
fn merge_keywords(parts: impl IntoIterator<Item = String>) -> String {
    let mut keywords: Vec<String> = Vec::new();
    for part in parts {
        for keyword in part.split(',') {
            let keyword = keyword.trim().to_string();
            if !keyword.is_empty() && !keywords.iter().any(|k| k == &keyword) {
                keywords.push(keyword);
            }
        }
    }
    keywords.sort();
    keywords.join(", ")
}

pub(crate) fn entity_vector_id(name: &str) -> String {
    format!("ent-{:x}", md5::compute(name.as_bytes()))
}

pub(crate) fn relation_vector_id(a: &str, b: &str) -> String {
    format!("rel-{:x}", md5::compute(format!("{a}||{b}").as_bytes()))
}

/// Fusiona extracciones en el grafo y los índices vectoriales.
pub struct Merger {
    graph: Arc<dyn GraphStorage>,
    entities_vdb: Arc<dyn VectorStorage>,
    relations_vdb: Arc<dyn VectorStorage>,
    entities_kv: Arc<dyn KvStorage>,
    relations_kv: Arc<dyn KvStorage>,
    llm: LlmManager,
    tokenizer: SharedTokenizer,
    locks: Arc<KeyedLocks>,
    cfg: MergeConfig,
}

/// Parámetros de fusión tomados de la configuración global.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub force_llm_summary_on_merge: usize,
    pub summary_max_tokens: usize,
    pub summary_length_recommended: usize,
    pub source_ids_limit_method: SourceIdsLimitMethod,
    pub max_source_ids_per_entity: usize,
    pub max_source_ids_per_relation: usize,
    pub language: String,
    pub max_async: usize,
}

impl MergeConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        MergeConfig {
            force_llm_summary_on_merge: cfg.force_llm_summary_on_merge,
            summary_max_tokens: cfg.summary_max_tokens,
            summary_length_recommended: cfg.summary_length_recommended,
            source_ids_limit_method: cfg.source_ids_limit_method,
            max_source_ids_per_entity: cfg.max_source_ids_per_entity,
            max_source_ids_per_relation: cfg.max_source_ids_per_relation,
            language: cfg.language.clone(),
            max_async: cfg.max_async,
        }
    }
}

impl Merger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<dyn GraphStorage>,
        entities_vdb: Arc<dyn VectorStorage>,
        relations_vdb: Arc<dyn VectorStorage>,
        entities_kv: Arc<dyn KvStorage>,
        relations_kv: Arc<dyn KvStorage>,
        llm: LlmManager,
        tokenizer: SharedTokenizer,
        locks: Arc<KeyedLocks>,
        cfg: MergeConfig,
    ) -> Self {
        Merger {
            graph,
            entities_vdb,
            relations_vdb,
            entities_kv,
            relations_kv,
            llm,
            tokenizer,
            locks,
            cfg,
        }
    }

    /// Fusiona todos los grupos: primero las entidades (las relaciones
    /// necesitan sus extremos en el grafo), después las relaciones.
    pub async fn merge_all(&self, grouped: GroupedExtractions) -> Result<()> {
        let entity_count = grouped.entities.len();
        let relation_count = grouped.relations.len();

        stream::iter(grouped.entities.into_iter().map(Ok::<_, crate::error::RagError>))
            .try_for_each_concurrent(self.cfg.max_async, |(name, fragments)| async move {
                self.merge_entity(&name, &fragments).await
            })
            .await?;

        stream::iter(grouped.relations.into_iter().map(Ok::<_, crate::error::RagError>))
            .try_for_each_concurrent(self.cfg.max_async, |(pair, fragments)| async move {
                self.merge_relation(&pair.0, &pair.1, &fragments).await
            })
            .await?;

        info!("Fusionadas {entity_count} entidades y {relation_count} relaciones");
        Ok(())
    }

    /// Resume una lista de descripciones con el LLM, acotado a la
    /// longitud recomendada.
    async fn summarize_descriptions(
        &self,
        key: &str,
        descriptions: &[String],
    ) -> Result<String> {
        let listed = descriptions
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = render(
            prompts::SUMMARIZE_DESCRIPTIONS,
            &[
                ("entity_name", key),
                ("description_list", &listed),
                ("language", &self.cfg.language),
                (
                    "summary_length",
                    &self.cfg.summary_length_recommended.to_string(),
                ),
            ],
        );
        self.llm.generate(&prompt, &GenerateOpts::default()).await
    }

    /// Fusión de una entidad según el protocolo de §fusión: descripciones
    /// deduplicadas y unidas, resumen LLM al cruzar los umbrales, unión
    /// de `source_id` y upsert vectorial antes que el del grafo.
    pub async fn merge_entity(
        &self,
        name: &str,
        fragments: &[ExtractedEntity],
    ) -> Result<()> {
        if fragments.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.acquire(&format!("node:{name}")).await;

        let descriptions = dedup_trimmed(
            fragments.iter().map(|f| f.description.clone()),
        );
        let mut joined = descriptions.join(" ");
        if fragments.len() >= self.cfg.force_llm_summary_on_merge
            || self.tokenizer.count(&joined) >= self.cfg.summary_max_tokens
        {
            debug!("Descripción de '{name}' resumida con el LLM");
            joined = self.summarize_descriptions(name, &descriptions).await?;
        }

        let new_source_ids =
            dedup_trimmed(fragments.iter().map(|f| f.source_chunk_id.clone()));
        let existing = self.graph.get_node(name).await?;

        let attrs = match existing {
            Some(node) => NodeAttrs {
                // El tipo lo fija el primer fragmento visto; no se
                // sobreescribe en fusiones posteriores.
                entity_type: node.entity_type.clone(),
                description: combine_descriptions(&node.description, &joined),
                source_id: merge_source_ids(
                    &node.source_id,
                    &new_source_ids,
                    self.cfg.max_source_ids_per_entity,
                    self.cfg.source_ids_limit_method,
                ),
                file_path: node.file_path,
            },
            None => NodeAttrs {
                entity_type: fragments[0].entity_type.clone(),
                description: joined,
                source_id: merge_source_ids(
                    "",
                    &new_source_ids,
                    self.cfg.max_source_ids_per_entity,
                    self.cfg.source_ids_limit_method,
                ),
                file_path: None,
            },
        };

        self.upsert_entity(name, attrs).await
    }

    /// Escribe una entidad en índice vectorial, grafo y KV espejo. El
    /// registro vectorial va primero para que ningún lector vea un nodo
    /// sin su contrapartida vectorial.
    async fn upsert_entity(&self, name: &str, attrs: NodeAttrs) -> Result<()> {
        let content = format!("{name}\n{}", attrs.description);
        let embedding = self.llm.embed(&[content.clone()]).await?.remove(0);
        let record = VectorRecord {
            id: entity_vector_id(name),
            embedding,
            content: Some(content),
            metadata: [
                ("entity_name".to_string(), json!(name)),
                ("entity_type".to_string(), json!(attrs.entity_type)),
            ]
            .into_iter()
            .collect(),
        };
        self.entities_vdb.upsert(vec![record]).await?;
        self.graph.upsert_node(name, attrs.clone()).await?;
        self.entities_kv
            .upsert(HashMap::from([(
                name.to_string(),
                serde_json::to_value(&attrs).unwrap_or_default(),
            )]))
            .await?;
        Ok(())
    }

    /// Fusión de una relación: suma de pesos, unión de descripciones y
    /// palabras clave, y los mismos criterios de `source_id` que las
    /// entidades. Crea extremos desconocidos como nodos mínimos.
    pub async fn merge_relation(
        &self,
        a: &str,
        b: &str,
        fragments: &[ExtractedRelation],
    ) -> Result<()> {
        if fragments.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.acquire(&format!("edge:{a}||{b}")).await;

        let weight_sum: f64 = fragments.iter().map(|f| f.weight).sum();
        let descriptions = dedup_trimmed(
            fragments.iter().map(|f| f.description.clone()),
        );
        let mut joined = descriptions.join(" ");
        if fragments.len() >= self.cfg.force_llm_summary_on_merge
            || self.tokenizer.count(&joined) >= self.cfg.summary_max_tokens
        {
            let key = format!("{a} -> {b}");
            joined = self.summarize_descriptions(&key, &descriptions).await?;
        }
        let keywords = merge_keywords(fragments.iter().map(|f| f.keywords.clone()));
        let new_source_ids =
            dedup_trimmed(fragments.iter().map(|f| f.source_chunk_id.clone()));

        // Extremos que el extractor mencionó sólo en la relación. El
        // cerrojo de nodo (la misma clave que usa `merge_entity`)
        // serializa la comprobación-y-alta frente a fusiones concurrentes
        // sobre el mismo nombre; se toma y suelta por extremo.
        for endpoint in [a, b] {
            let _node_guard = self.locks.acquire(&format!("node:{endpoint}")).await;
            if !self.graph.has_node(endpoint).await? {
                let attrs = NodeAttrs {
                    entity_type: "unknown".to_string(),
                    description: joined.clone(),
                    source_id: join_source_ids(new_source_ids.iter()),
                    file_path: None,
                };
                self.upsert_entity(endpoint, attrs).await?;
            }
        }

        let existing = self.graph.get_edge(a, b).await?;
        let attrs = match existing {
            Some(edge) => EdgeAttrs {
                weight: edge.weight + weight_sum,
                description: combine_descriptions(&edge.description, &joined),
                keywords: merge_keywords([edge.keywords, keywords]),
                source_id: merge_source_ids(
                    &edge.source_id,
                    &new_source_ids,
                    self.cfg.max_source_ids_per_relation,
                    self.cfg.source_ids_limit_method,
                ),
            },
            None => EdgeAttrs {
                weight: weight_sum,
                description: joined,
                keywords,
                source_id: merge_source_ids(
                    "",
                    &new_source_ids,
                    self.cfg.max_source_ids_per_relation,
                    self.cfg.source_ids_limit_method,
                ),
            },
        };

        let content = format!("{}\t{a}\n{b}\n{}", attrs.keywords, attrs.description);
        let embedding = self.llm.embed(&[content.clone()]).await?.remove(0);
        let record = VectorRecord {
            id: relation_vector_id(a, b),
            embedding,
            content: Some(content),
            metadata: [
                ("src_id".to_string(), json!(a)),
                ("tgt_id".to_string(), json!(b)),
                ("keywords".to_string(), json!(attrs.keywords)),
            ]
            .into_iter()
            .collect(),
        };
        self.relations_vdb.upsert(vec![record]).await?;
        self.graph.upsert_edge(a, b, attrs.clone()).await?;
        self.relations_kv
            .upsert(HashMap::from([(
                format!("{a}||{b}"),
                serde_json::to_value(&attrs).unwrap_or_default(),
            )]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_limit_honors_both_policies() {
        // P8: |source_id| <= límite; FIFO conserva los nuevos, KEEP los
        // antiguos.
        let existing = join_source_ids(["c1", "c2", "c3"]);
        let new_ids = vec!["c4".to_string(), "c5".to_string()];

        let fifo = merge_source_ids(&existing, &new_ids, 3, SourceIdsLimitMethod::Fifo);
        assert_eq!(split_source_id(&fifo), vec!["c3", "c4", "c5"]);

        let keep = merge_source_ids(&existing, &new_ids, 3, SourceIdsLimitMethod::Keep);
        assert_eq!(split_source_id(&keep), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn source_id_merge_deduplicates() {
        let existing = join_source_ids(["c1", "c2"]);
        let merged = merge_source_ids(
            &existing,
            &["c2".to_string(), "c3".to_string()],
            10,
            SourceIdsLimitMethod::Fifo,
        );
        assert_eq!(split_source_id(&merged), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn combined_descriptions_are_order_independent() {
        let ab = combine_descriptions("nació en Ulm.", "recibió el Nobel.");
        let ba = combine_descriptions("recibió el Nobel.", "nació en Ulm.");
        assert_eq!(ab, ba);
        // Texto repetido no se duplica.
        assert_eq!(combine_descriptions("x", "x"), "x");
    }

    #[test]
    fn keywords_union_is_sorted_and_deduplicated() {
        let merged = merge_keywords([
            "beta, alfa".to_string(),
            "alfa, gamma".to_string(),
        ]);
        assert_eq!(merged, "alfa, beta, gamma");
    }
}
