//! Capa de almacenamiento: cuatro contratos de capacidad (KV, vectorial,
//! grafo y estado de documentos) y el registro de backends por nombre.
//!
//! Cualquier implementación que satisfaga el contrato es enchufable; el
//! resto del motor depende sólo de los traits.

pub mod json_graph;
pub mod json_kv;
pub mod json_vector;
pub mod neo4j_graph;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::{RagError, Result};
use crate::llm::Embedder;
use crate::models::{
    canonical_pair, DocRecord, DocStatus, EdgeAttrs, KnowledgeSubgraph, NodeAttrs,
    SubgraphEdge, SubgraphNode, VectorHit, VectorRecord,
};

/// Máximo de semillas desde las que arranca la expansión BFS del subgrafo.
pub const SUBGRAPH_MAX_SEEDS: usize = 10;

/// Almacén clave-valor con commit explícito como barrera de durabilidad.
/// Las lecturas de ids ausentes devuelven `None`, nunca un error.
#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Value>>;
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Option<Value>>>;
    /// Subconjunto de `ids` que no está presente; se usa para evitar
    /// reprocesar contenido ya ingerido.
    async fn missing_keys(&self, ids: &HashSet<String>) -> Result<HashSet<String>>;
    async fn upsert(&self, data: HashMap<String, Value>) -> Result<()>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    async fn is_empty(&self) -> Result<bool>;
    /// Barrera de durabilidad; idempotente sin mutaciones intermedias.
    async fn commit(&self) -> Result<()>;
    async fn drop_all(&self) -> Result<()>;
}

/// Índice vectorial con similitud coseno como referencia.
#[async_trait]
pub trait VectorStorage: Send + Sync {
    /// Devuelve como máximo `top_k` registros con `score >= umbral`,
    /// ordenados por puntuación descendente. Si `precomputed` está
    /// presente se usa en lugar de volver a embeber `text`.
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        precomputed: Option<&[f32]>,
    ) -> Result<Vec<VectorHit>>;
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    /// Borra los registros cuyo metadato `entity_name` coincide.
    async fn delete_by_entity(&self, entity_name: &str) -> Result<()>;
    /// Borra los registros cuyo metadato `src_id` o `tgt_id` coincide.
    async fn delete_by_entity_relation(&self, entity_name: &str) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<VectorRecord>>;
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Option<VectorRecord>>>;
    async fn commit(&self) -> Result<()>;
    async fn drop_all(&self) -> Result<()>;
}

/// Grafo no dirigido de entidades y relaciones. Las aristas se consultan
/// por cualquiera de los dos órdenes de extremos.
#[async_trait]
pub trait GraphStorage: Send + Sync {
    async fn has_node(&self, id: &str) -> Result<bool>;
    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>>;
    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()>;
    async fn delete_node(&self, id: &str) -> Result<()>;
    async fn node_degree(&self, id: &str) -> Result<usize>;
    async fn get_nodes_batch(&self, ids: &[String]) -> Result<HashMap<String, NodeAttrs>>;
    async fn node_degrees_batch(&self, ids: &[String]) -> Result<HashMap<String, usize>>;
    async fn all_nodes(&self) -> Result<Vec<(String, NodeAttrs)>>;
    async fn all_labels(&self) -> Result<Vec<String>>;

    async fn has_edge(&self, a: &str, b: &str) -> Result<bool>;
    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<EdgeAttrs>>;
    async fn upsert_edge(&self, a: &str, b: &str, attrs: EdgeAttrs) -> Result<()>;
    async fn edges_of(&self, id: &str) -> Result<Vec<(String, String)>>;
    async fn get_edges_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<(String, String), EdgeAttrs>>;
    async fn remove_edges(&self, pairs: &[(String, String)]) -> Result<()>;
    async fn all_edges(&self) -> Result<Vec<((String, String), EdgeAttrs)>>;

    /// Grado combinado de una arista: `degree(a) + degree(b)`.
    async fn edge_degree(&self, a: &str, b: &str) -> Result<usize> {
        Ok(self.node_degree(a).await? + self.node_degree(b).await?)
    }

    /// Expansión en anchura desde las primeras [`SUBGRAPH_MAX_SEEDS`]
    /// semillas que casan con `label_filter` (`*` casa con todo).
    /// `truncated` es verdadero si la frontera quedó sin vaciar.
    async fn knowledge_subgraph(
        &self,
        label_filter: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<KnowledgeSubgraph> {
        let mut seeds: Vec<String> = Vec::new();
        let mut labels = self.all_labels().await?;
        labels.sort();
        for label in labels {
            let matches = label_filter == "*"
                || label == label_filter
                || label.contains(label_filter);
            if matches {
                seeds.push(label);
                if seeds.len() >= SUBGRAPH_MAX_SEEDS {
                    break;
                }
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut nodes: Vec<SubgraphNode> = Vec::new();
        let mut edge_keys: HashSet<(String, String)> = HashSet::new();
        let mut edges: Vec<SubgraphEdge> = Vec::new();
        let mut queue: VecDeque<(String, usize)> =
            seeds.into_iter().map(|s| (s, 0usize)).collect();

        while let Some((id, depth)) = queue.pop_front() {
            if visited.contains(&id) {
                continue;
            }
            if nodes.len() >= max_nodes {
                // Reencolamos el nodo no consumido para que la frontera
                // refleje la truncación.
                queue.push_front((id, depth));
                break;
            }
            let Some(attrs) = self.get_node(&id).await? else {
                continue;
            };
            visited.insert(id.clone());
            nodes.push(SubgraphNode {
                id: id.clone(),
                attrs,
            });

            if depth >= max_depth {
                continue;
            }
            for (a, b) in self.edges_of(&id).await? {
                let key = canonical_pair(&a, &b);
                if edge_keys.insert(key.clone()) {
                    if let Some(edge_attrs) = self.get_edge(&key.0, &key.1).await? {
                        edges.push(SubgraphEdge {
                            source: key.0.clone(),
                            target: key.1.clone(),
                            attrs: edge_attrs,
                        });
                    }
                }
                let neighbor = if a == id { b } else { a };
                if !visited.contains(&neighbor) {
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }

        // La frontera restante puede contener sólo nodos ya visitados;
        // éstos no cuentan como truncación.
        let truncated = queue.iter().any(|(id, _)| !visited.contains(id));

        Ok(KnowledgeSubgraph {
            nodes,
            edges,
            truncated,
        })
    }

    async fn commit(&self) -> Result<()>;
    async fn drop_all(&self) -> Result<()>;
}

/// Estado de documentos: especialización del KV con claves `doc_id` y
/// marcas de tiempo mantenidas automáticamente.
#[async_trait]
pub trait DocStatusStorage: Send + Sync {
    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>>;
    async fn upsert_doc(&self, record: DocRecord) -> Result<()>;
    async fn delete_doc(&self, doc_id: &str) -> Result<()>;
    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocRecord>>;
    async fn is_processed(&self, doc_id: &str) -> Result<bool>;
    async fn mark_processing(&self, doc_id: &str) -> Result<()>;
    async fn mark_processed(
        &self,
        doc_id: &str,
        chunks_count: usize,
        chunk_ids: Vec<String>,
    ) -> Result<()>;
    async fn mark_failed(&self, doc_id: &str, error_msg: &str) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn drop_all(&self) -> Result<()>;
}

/// Ruta de un fichero de persistencia: `{working_dir}/{namespace}/{name}.json`.
pub fn storage_file(working_dir: &str, namespace: &str, name: &str) -> PathBuf {
    Path::new(working_dir).join(namespace).join(format!("{name}.json"))
}

/// Escritura atómica: volcado a fichero temporal y renombrado.
pub fn atomic_write_json<T: Serialize>(
    path: &Path,
    value: &T,
    backend: &'static str,
) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        RagError::storage(backend, "commit", "ruta de persistencia sin directorio")
    })?;
    std::fs::create_dir_all(parent)
        .map_err(|e| RagError::storage(backend, "commit", e))?;
    let payload = serde_json::to_vec_pretty(value)
        .map_err(|e| RagError::storage(backend, "commit", e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, payload).map_err(|e| RagError::storage(backend, "commit", e))?;
    std::fs::rename(&tmp, path).map_err(|e| RagError::storage(backend, "commit", e))?;
    Ok(())
}

/// Carga un JSON persistido si existe; `None` en el primer arranque.
pub fn load_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    backend: &'static str,
) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path).map_err(|e| RagError::storage(backend, "load", e))?;
    let value =
        serde_json::from_slice(&raw).map_err(|e| RagError::storage(backend, "load", e))?;
    Ok(Some(value))
}

/// Conjunto de almacenes resuelto por el registro de backends.
pub struct StorageSet {
    pub docs_kv: Arc<dyn KvStorage>,
    pub chunks_kv: Arc<dyn KvStorage>,
    pub entities_kv: Arc<dyn KvStorage>,
    pub relations_kv: Arc<dyn KvStorage>,
    pub llm_cache_kv: Arc<dyn KvStorage>,
    pub entities_vdb: Arc<dyn VectorStorage>,
    pub relations_vdb: Arc<dyn VectorStorage>,
    pub chunks_vdb: Arc<dyn VectorStorage>,
    pub graph: Arc<dyn GraphStorage>,
    pub doc_status: Arc<dyn DocStatusStorage>,
}

impl StorageSet {
    /// Resuelve los nombres de backend de la configuración a
    /// implementaciones registradas.
    pub async fn from_config(cfg: &AppConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let kv = |name: &'static str| -> Result<Arc<dyn KvStorage>> {
            match cfg.kv_storage.as_str() {
                "json_kv" => Ok(Arc::new(json_kv::JsonKvStorage::new(
                    &cfg.working_dir,
                    &cfg.namespace,
                    name,
                )?)),
                other => Err(RagError::Configuration {
                    param: "kv_storage",
                    value: other.to_string(),
                }),
            }
        };

        let vdb = |name: &'static str| -> Result<Arc<dyn VectorStorage>> {
            match cfg.vector_storage.as_str() {
                "json_vector" => Ok(Arc::new(json_vector::JsonVectorStorage::new(
                    &cfg.working_dir,
                    &cfg.namespace,
                    name,
                    Arc::clone(&embedder),
                    cfg.cosine_threshold,
                )?)),
                other => Err(RagError::Configuration {
                    param: "vector_storage",
                    value: other.to_string(),
                }),
            }
        };

        let graph: Arc<dyn GraphStorage> = match cfg.graph_storage.as_str() {
            "json_graph" => Arc::new(json_graph::JsonGraphStorage::new(
                &cfg.working_dir,
                &cfg.namespace,
                "graph_data",
            )?),
            "neo4j_graph" => Arc::new(neo4j_graph::Neo4jGraphStorage::connect(cfg).await?),
            other => {
                return Err(RagError::Configuration {
                    param: "graph_storage",
                    value: other.to_string(),
                })
            }
        };

        let doc_status: Arc<dyn DocStatusStorage> = match cfg.doc_status_storage.as_str() {
            "json_doc_status" => Arc::new(json_kv::JsonDocStatusStorage::new(
                &cfg.working_dir,
                &cfg.namespace,
                "doc_status",
            )?),
            other => {
                return Err(RagError::Configuration {
                    param: "doc_status_storage",
                    value: other.to_string(),
                })
            }
        };

        Ok(StorageSet {
            docs_kv: kv("docs")?,
            chunks_kv: kv("chunks")?,
            entities_kv: kv("entities_kv")?,
            relations_kv: kv("relations_kv")?,
            llm_cache_kv: kv("llm_cache")?,
            entities_vdb: vdb("entities_vdb")?,
            relations_vdb: vdb("relations_vdb")?,
            chunks_vdb: vdb("chunks_vdb")?,
            graph,
            doc_status,
        })
    }

    /// Barrera de durabilidad sobre todos los almacenes.
    pub async fn commit_all(&self) -> Result<()> {
        self.docs_kv.commit().await?;
        self.chunks_kv.commit().await?;
        self.entities_kv.commit().await?;
        self.relations_kv.commit().await?;
        self.llm_cache_kv.commit().await?;
        self.entities_vdb.commit().await?;
        self.relations_vdb.commit().await?;
        self.chunks_vdb.commit().await?;
        GraphStorage::commit(self.graph.as_ref()).await?;
        self.doc_status.commit().await?;
        Ok(())
    }
}
