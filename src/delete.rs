//! Coordinador de borrado: elimina un documento y sus chunks, recorta
//! la procedencia (`source_id`) de nodos y aristas afectados y poda los
//! huérfanos del grafo y de los índices vectoriales.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::engine::RagEngine;
use crate::error::Result;
use crate::models::{
    canonical_pair, join_source_ids, split_source_id, DeletionOutcome, DeletionResult,
};
use crate::storage::{DocStatusStorage, GraphStorage, KvStorage, VectorStorage};

/// Opciones del borrado de un documento.
#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub delete_chunks: bool,
    pub rebuild_graph: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        DeleteOptions {
            delete_chunks: true,
            rebuild_graph: false,
        }
    }
}

/// Borra un documento completo. Una única pasada sobre `all_nodes` y
/// `all_edges` construye el índice inverso `chunk_id -> afectados`; no
/// se reescanea el grafo por cada chunk.
pub async fn delete_document(
    engine: &RagEngine,
    doc_id: &str,
    opts: DeleteOptions,
) -> Result<DeletionResult> {
    let Some(doc) = engine.stores.doc_status.get_doc(doc_id).await? else {
        return Ok(DeletionResult {
            outcome: DeletionOutcome::NotFound,
            doc_id: doc_id.to_string(),
            message: format!("documento {doc_id} no encontrado"),
            chunks_removed: 0,
            entities_removed: 0,
            entities_updated: 0,
            relations_removed: 0,
            relations_updated: 0,
        });
    };

    let chunk_ids: HashSet<String> =
        doc.chunk_ids.clone().unwrap_or_default().into_iter().collect();

    // Pasada única sobre el grafo buscando menciones a los chunks del
    // documento.
    let mut affected_entities: HashMap<String, Vec<String>> = HashMap::new();
    for (name, attrs) in engine.stores.graph.all_nodes().await? {
        let sources = split_source_id(&attrs.source_id);
        let remaining: Vec<String> = sources
            .iter()
            .filter(|id| !chunk_ids.contains(*id))
            .cloned()
            .collect();
        if remaining.len() != sources.len() {
            affected_entities.insert(name, remaining);
        }
    }

    let mut affected_edges: HashMap<(String, String), Vec<String>> = HashMap::new();
    for (pair, attrs) in engine.stores.graph.all_edges().await? {
        let sources = split_source_id(&attrs.source_id);
        let remaining: Vec<String> = sources
            .iter()
            .filter(|id| !chunk_ids.contains(*id))
            .cloned()
            .collect();
        if remaining.len() != sources.len() {
            affected_edges.insert(pair, remaining);
        }
    }

    let mut result = DeletionResult {
        outcome: DeletionOutcome::Deleted,
        doc_id: doc_id.to_string(),
        message: String::new(),
        chunks_removed: 0,
        entities_removed: 0,
        entities_updated: 0,
        relations_removed: 0,
        relations_updated: 0,
    };

    // Aristas primero: así los grados de los nodos supervivientes
    // reflejan el grafo podado.
    for (pair, remaining) in affected_edges {
        if remaining.is_empty() {
            engine
                .stores
                .graph
                .remove_edges(&[pair.clone()])
                .await?;
            engine
                .stores
                .relations_vdb
                .delete(&[crate::merge::relation_vector_id(&pair.0, &pair.1)])
                .await?;
            engine
                .stores
                .relations_kv
                .delete(&[format!("{}||{}", pair.0, pair.1)])
                .await?;
            result.relations_removed += 1;
        } else if let Some(mut attrs) = engine.stores.graph.get_edge(&pair.0, &pair.1).await? {
            attrs.source_id = join_source_ids(remaining);
            engine
                .stores
                .graph
                .upsert_edge(&pair.0, &pair.1, attrs.clone())
                .await?;
            engine
                .stores
                .relations_kv
                .upsert(HashMap::from([(
                    format!("{}||{}", pair.0, pair.1),
                    serde_json::to_value(&attrs).unwrap_or_default(),
                )]))
                .await?;
            result.relations_updated += 1;
        }
    }

    for (name, remaining) in &affected_entities {
        if remaining.is_empty() {
            // Candidato a huérfano. La procedencia de nodo y la de arista
            // se llevan por separado: una arista incidente puede conservar
            // chunks de otros documentos aunque la del nodo quede vacía.
            // La pasada de aristas ya podó las huérfanas, así que lo que
            // siga incidente aquí está vivo y el nodo debe conservarse.
            let incident = engine.stores.graph.edges_of(name).await?;
            let pairs: Vec<(String, String)> =
                incident.iter().map(|(x, y)| canonical_pair(x, y)).collect();
            let edges = engine.stores.graph.get_edges_batch(&pairs).await?;
            let mut rehomed: Vec<String> = Vec::new();
            for pair in &pairs {
                if let Some(edge) = edges.get(pair) {
                    for id in split_source_id(&edge.source_id) {
                        if !rehomed.iter().any(|x| x == &id) {
                            rehomed.push(id);
                        }
                    }
                }
            }

            if rehomed.is_empty() {
                // Huérfano real: sin aristas incidentes vivas, desaparece
                // del grafo y del índice vectorial. Cualquier registro
                // vectorial de relación que aún apunte a este extremo está
                // obsoleto por definición.
                engine.stores.graph.delete_node(name).await?;
                engine.stores.entities_vdb.delete_by_entity(name).await?;
                engine
                    .stores
                    .relations_vdb
                    .delete_by_entity_relation(name)
                    .await?;
                engine.stores.entities_kv.delete(&[name.clone()]).await?;
                result.entities_removed += 1;
            } else if let Some(mut attrs) = engine.stores.graph.get_node(name).await? {
                // El nodo sobrevive con la procedencia re-derivada de sus
                // aristas vivas.
                attrs.source_id = join_source_ids(rehomed);
                engine
                    .stores
                    .graph
                    .upsert_node(name, attrs.clone())
                    .await?;
                engine
                    .stores
                    .entities_kv
                    .upsert(HashMap::from([(
                        name.clone(),
                        serde_json::to_value(&attrs).unwrap_or_default(),
                    )]))
                    .await?;
                result.entities_updated += 1;
            }
        } else if let Some(mut attrs) = engine.stores.graph.get_node(name).await? {
            attrs.source_id = join_source_ids(remaining);
            engine
                .stores
                .graph
                .upsert_node(name, attrs.clone())
                .await?;
            engine
                .stores
                .entities_kv
                .upsert(HashMap::from([(
                    name.clone(),
                    serde_json::to_value(&attrs).unwrap_or_default(),
                )]))
                .await?;
            result.entities_updated += 1;
        }
    }

    if opts.rebuild_graph {
        // La reconstrucción completa reextraería los chunks restantes de
        // cada entidad afectada; el protocolo admite dejarlo registrado.
        warn!(
            "rebuild_graph solicitado para {doc_id}: {} entidades conservan procedencia reducida",
            result.entities_updated
        );
    }

    if opts.delete_chunks {
        let ids: Vec<String> = chunk_ids.iter().cloned().collect();
        engine.stores.chunks_kv.delete(&ids).await?;
        engine.stores.chunks_vdb.delete(&ids).await?;
        result.chunks_removed = ids.len();
    }

    engine.stores.docs_kv.delete(&[doc_id.to_string()]).await?;
    engine.stores.doc_status.delete_doc(doc_id).await?;
    engine.stores.commit_all().await?;

    result.message = format!(
        "documento {doc_id} borrado: {} chunks, {} entidades eliminadas, {} actualizadas, {} relaciones eliminadas, {} actualizadas",
        result.chunks_removed,
        result.entities_removed,
        result.entities_updated,
        result.relations_removed,
        result.relations_updated,
    );
    info!("{}", result.message);
    Ok(result)
}
