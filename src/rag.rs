//! Motor de consulta: elicitación de palabras clave, recuperación
//! multi-modo (grafo + vectores), deduplicación, rerank opcional,
//! ensamblado de contexto bajo presupuestos duros de tokens y
//! generación de la respuesta.

use std::collections::HashSet;

use futures::stream::BoxStream;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::engine::{CancelFlag, RagEngine};
use crate::error::{RagError, Result};
use crate::llm::GenerateOpts;
use crate::models::{
    canonical_pair, split_source_id, ChunkRecord, QueryKeywords, QueryMetadata,
    QueryMode, QueryParam, QueryRawData, QueryResult,
};
use crate::prompts::{self, render, FAIL_RESPONSE};
use crate::storage::{GraphStorage, KvStorage, VectorStorage};

/// Entidad seleccionada durante la recuperación.
#[derive(Debug, Clone)]
struct EntityView {
    name: String,
    entity_type: String,
    description: String,
    source_id: String,
    degree: usize,
}

/// Relación seleccionada durante la recuperación.
#[derive(Debug, Clone)]
struct RelationView {
    src: String,
    tgt: String,
    description: String,
    keywords: String,
    weight: f64,
    degree: usize,
}

/// Chunk candidato a entrar en el contexto.
#[derive(Debug, Clone)]
struct ChunkView {
    chunk_id: String,
    content: String,
    file_path: Option<String>,
}

/// Qué índices consulta cada modo.
#[derive(Debug, Clone, Copy, Default)]
struct ModePlan {
    entities: bool,
    relations: bool,
    chunks_direct: bool,
    chunks_via_entity: bool,
}

fn plan_for(mode: QueryMode) -> ModePlan {
    match mode {
        QueryMode::Bypass => ModePlan::default(),
        QueryMode::Naive => ModePlan {
            chunks_direct: true,
            ..ModePlan::default()
        },
        QueryMode::Local => ModePlan {
            entities: true,
            chunks_via_entity: true,
            ..ModePlan::default()
        },
        QueryMode::Global => ModePlan {
            entities: true,
            relations: true,
            ..ModePlan::default()
        },
        QueryMode::Hybrid => ModePlan {
            entities: true,
            relations: true,
            chunks_via_entity: true,
            ..ModePlan::default()
        },
        QueryMode::Mix => ModePlan {
            entities: true,
            relations: true,
            chunks_direct: true,
            chunks_via_entity: true,
        },
    }
}

fn fail_result(mode: QueryMode, keywords: QueryKeywords) -> QueryResult {
    QueryResult {
        response: FAIL_RESPONSE.to_string(),
        context: String::new(),
        raw_data: QueryRawData {
            metadata: QueryMetadata {
                query_mode: mode.as_str().to_string(),
                keywords,
            },
            ..QueryRawData::default()
        },
    }
}

/// Busca el primer objeto JSON embebido en una respuesta de LLM.
fn extract_first_json(response: &str) -> Option<serde_json::Value> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

/// Elicita palabras clave de alto y bajo nivel para la consulta. El
/// parseo es tolerante: cualquier fallo degrada a listas vacías.
async fn elicit_keywords(engine: &RagEngine, query: &str) -> QueryKeywords {
    let prompt = render(prompts::KEYWORDS_EXTRACTION, &[("query", query)]);
    let response = match engine.llm.generate(&prompt, &GenerateOpts::default()).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Elicitación de palabras clave fallida: {e}");
            return QueryKeywords::default();
        }
    };
    match extract_first_json(&response)
        .and_then(|v| serde_json::from_value::<QueryKeywords>(v).ok())
    {
        Some(keywords) => keywords,
        None => {
            warn!("Respuesta de palabras clave no parseable: '{response}'");
            QueryKeywords::default()
        }
    }
}

/// Recupera entidades por similitud vectorial y las ordena por grado
/// descendente (orden estable).
async fn search_entities(
    engine: &RagEngine,
    retrieval: &str,
    embedding: &[f32],
    param: &QueryParam,
) -> Result<Vec<EntityView>> {
    let hits = engine
        .stores
        .entities_vdb
        .query(retrieval, param.top_k, Some(embedding))
        .await?;

    let mut names: Vec<String> = Vec::new();
    for hit in &hits {
        if let Some(threshold) = param.cos_sim_threshold {
            if hit.score < threshold {
                continue;
            }
        }
        if let Some(name) = hit.metadata_str("entity_name") {
            if !names.iter().any(|n| n == &name) {
                names.push(name);
            }
        }
    }

    let nodes = engine.stores.graph.get_nodes_batch(&names).await?;
    let degrees = engine.stores.graph.node_degrees_batch(&names).await?;

    let mut views: Vec<EntityView> = Vec::new();
    for name in names {
        match nodes.get(&name) {
            Some(attrs) => views.push(EntityView {
                degree: degrees.get(&name).copied().unwrap_or(0),
                entity_type: attrs.entity_type.clone(),
                description: attrs.description.clone(),
                source_id: attrs.source_id.clone(),
                name,
            }),
            // Un hit vectorial sin contrapartida en el grafo no se
            // devuelve nunca al llamante.
            None => warn!("Hit vectorial sin nodo en el grafo: {name}"),
        }
    }
    views.sort_by(|a, b| b.degree.cmp(&a.degree));
    Ok(views)
}

/// Aristas incidentes a las entidades seleccionadas, ordenadas por
/// grado combinado y peso descendentes.
async fn search_relations(
    engine: &RagEngine,
    entities: &[EntityView],
) -> Result<Vec<RelationView>> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for entity in entities {
        for (a, b) in engine.stores.graph.edges_of(&entity.name).await? {
            let key = canonical_pair(&a, &b);
            if seen.insert(key.clone()) {
                pairs.push(key);
            }
        }
    }

    let attrs = engine.stores.graph.get_edges_batch(&pairs).await?;
    let mut views: Vec<RelationView> = Vec::new();
    for pair in pairs {
        let Some(edge) = attrs.get(&pair) else { continue };
        let degree = engine.stores.graph.edge_degree(&pair.0, &pair.1).await?;
        views.push(RelationView {
            src: pair.0,
            tgt: pair.1,
            description: edge.description.clone(),
            keywords: edge.keywords.clone(),
            weight: edge.weight,
            degree,
        });
    }
    views.sort_by(|a, b| {
        b.degree.cmp(&a.degree).then_with(|| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    Ok(views)
}

/// Chunks referenciados por el `source_id` de las entidades, en el
/// orden de ranking de las entidades.
async fn chunks_via_entities(
    engine: &RagEngine,
    entities: &[EntityView],
) -> Result<Vec<ChunkView>> {
    let mut ids: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for entity in entities {
        for id in split_source_id(&entity.source_id) {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }

    let values = engine.stores.chunks_kv.get_many(&ids).await?;
    let mut views = Vec::new();
    for (id, value) in ids.into_iter().zip(values) {
        let Some(value) = value else {
            warn!("source_id apunta a un chunk inexistente: {id}");
            continue;
        };
        if let Ok(record) = serde_json::from_value::<ChunkRecord>(value) {
            views.push(ChunkView {
                chunk_id: id,
                content: record.content,
                file_path: record.file_path,
            });
        }
    }
    Ok(views)
}

/// Chunks recuperados directamente del índice vectorial de documentos.
async fn chunks_direct(
    engine: &RagEngine,
    retrieval: &str,
    embedding: &[f32],
    param: &QueryParam,
) -> Result<Vec<ChunkView>> {
    let hits = engine
        .stores
        .chunks_vdb
        .query(retrieval, param.chunk_top_k, Some(embedding))
        .await?;
    Ok(hits
        .into_iter()
        .filter_map(|hit| {
            hit.record.content.clone().map(|content| ChunkView {
                chunk_id: hit.id.clone(),
                content,
                file_path: hit.metadata_str("file_path"),
            })
        })
        .collect())
}

/// Rerank externo de los chunks supervivientes. Cualquier error del
/// proveedor conserva el orden original.
async fn rerank_chunks(
    engine: &RagEngine,
    query: &str,
    chunks: Vec<ChunkView>,
    param: &QueryParam,
) -> Vec<ChunkView> {
    if !param.enable_rerank || chunks.len() <= 1 || !engine.llm.has_reranker() {
        return chunks;
    }
    let docs: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    match engine.llm.rerank(query, &docs, None).await {
        Ok(mut scores) => {
            scores.retain(|s| {
                s.relevance_score >= param.min_rerank_score && s.index < chunks.len()
            });
            scores.sort_by(|a, b| {
                b.relevance_score
                    .partial_cmp(&a.relevance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            scores
                .into_iter()
                .map(|s| chunks[s.index].clone())
                .collect()
        }
        Err(e) => {
            warn!("Rerank fallido; se conserva el orden original: {e}");
            chunks
        }
    }
}

/// Prefijo voraz de `items` cuya suma de tokens (JSON serializado) no
/// supera `budget`. Devuelve los elementos retenidos y los tokens usados.
fn truncate_by_tokens(
    engine: &RagEngine,
    items: Vec<serde_json::Value>,
    budget: usize,
) -> (Vec<serde_json::Value>, usize) {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for item in items {
        let cost = engine.tokenizer.count(&item.to_string());
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(item);
    }
    (kept, used)
}

/// Contexto ensamblado listo para el generador.
struct AssembledContext {
    prompt: String,
    raw_data: QueryRawData,
}

/// Etapas 1 a 4: palabras clave, recuperación por modo, deduplicación,
/// rerank y ensamblado bajo presupuesto. El `Err` interior devuelve las
/// palabras clave cuando no queda contexto utilizable.
async fn build_query_context(
    engine: &RagEngine,
    query: &str,
    param: &QueryParam,
) -> Result<std::result::Result<AssembledContext, QueryKeywords>> {
    // Etapa 1: palabras clave.
    let keywords = if param.hl_keywords.is_empty() && param.ll_keywords.is_empty() {
        elicit_keywords(engine, query).await
    } else {
        QueryKeywords {
            high_level_keywords: param.hl_keywords.clone(),
            low_level_keywords: param.ll_keywords.clone(),
        }
    };

    let mut retrieval_parts: Vec<String> = Vec::new();
    retrieval_parts.extend(keywords.high_level_keywords.iter().cloned());
    retrieval_parts.extend(keywords.low_level_keywords.iter().cloned());
    retrieval_parts.push(query.to_string());
    let retrieval = retrieval_parts.join(" ");

    // Etapa 2: recuperación según el modo. El embedding de la consulta
    // se calcula una sola vez y se comparte entre los índices.
    let plan = plan_for(param.mode);
    let embedding = engine.llm.embed(&[retrieval.clone()]).await?.remove(0);

    let entities = if plan.entities {
        search_entities(engine, &retrieval, &embedding, param).await?
    } else {
        Vec::new()
    };
    let relations = if plan.relations {
        search_relations(engine, &entities).await?
    } else {
        Vec::new()
    };

    let mut chunks: Vec<ChunkView> = Vec::new();
    let mut seen_chunks: HashSet<String> = HashSet::new();
    if plan.chunks_via_entity {
        for chunk in chunks_via_entities(engine, &entities).await? {
            if seen_chunks.insert(chunk.chunk_id.clone()) {
                chunks.push(chunk);
            }
        }
    }
    if plan.chunks_direct {
        for chunk in chunks_direct(engine, &retrieval, &embedding, param).await? {
            if seen_chunks.insert(chunk.chunk_id.clone()) {
                chunks.push(chunk);
            }
        }
    }

    // Etapa 3: rerank opcional.
    let chunks = rerank_chunks(engine, query, chunks, param).await;

    // Etapa 4: presupuestos duros. Entidades y relaciones tienen el
    // suyo; el resto del presupuesto total queda para los chunks.
    let entity_items: Vec<serde_json::Value> = entities
        .iter()
        .map(|e| {
            json!({
                "entity": e.name,
                "type": e.entity_type,
                "description": e.description,
                "rank": e.degree,
            })
        })
        .collect();
    let (entity_items, entity_tokens) =
        truncate_by_tokens(engine, entity_items, param.max_entity_tokens);

    let relation_items: Vec<serde_json::Value> = relations
        .iter()
        .map(|r| {
            json!({
                "entity1": r.src,
                "entity2": r.tgt,
                "description": r.description,
                "keywords": r.keywords,
                "weight": r.weight,
                "rank": r.degree,
            })
        })
        .collect();
    let (relation_items, relation_tokens) =
        truncate_by_tokens(engine, relation_items, param.max_relation_tokens);

    let chunk_budget = param
        .max_total_tokens
        .saturating_sub(entity_tokens + relation_tokens);
    let mut chunk_items: Vec<serde_json::Value> = Vec::new();
    let mut used = 0usize;
    let mut references: Vec<serde_json::Value> = Vec::new();
    for chunk in &chunks {
        let reference_id = chunk_items.len() + 1;
        let item = json!({
            "reference_id": reference_id,
            "content": chunk.content,
            "file_path": chunk.file_path,
        });
        let cost = engine.tokenizer.count(&item.to_string());
        if used + cost > chunk_budget {
            break;
        }
        used += cost;
        references.push(json!({
            "reference_id": reference_id,
            "file_path": chunk.file_path.clone().unwrap_or_else(|| "unknown_source".to_string()),
        }));
        chunk_items.push(item);
    }

    if entity_items.is_empty() && relation_items.is_empty() && chunk_items.is_empty() {
        return Ok(Err(keywords));
    }

    debug!(
        "Contexto: {} entidades, {} relaciones, {} chunks",
        entity_items.len(),
        relation_items.len(),
        chunk_items.len()
    );

    let reference_list = references
        .iter()
        .filter_map(|r| {
            Some(format!(
                "[{}] {}",
                r.get("reference_id")?.as_u64()?,
                r.get("file_path")?.as_str()?
            ))
        })
        .collect::<Vec<_>>()
        .join("\n");

    let context_data = if param.mode == QueryMode::Naive {
        format!(
            "-----Document Chunks(DC)-----\n```json\n{}\n```\n\n-----References-----\n{}\n",
            serde_json::to_string_pretty(&chunk_items).unwrap_or_default(),
            reference_list,
        )
    } else {
        format!(
            "-----Entities(KG)-----\n```json\n{}\n```\n\n-----Relationships(KG)-----\n```json\n{}\n```\n\n-----Document Chunks(DC)-----\n```json\n{}\n```\n\n-----References-----\n{}\n",
            serde_json::to_string_pretty(&entity_items).unwrap_or_default(),
            serde_json::to_string_pretty(&relation_items).unwrap_or_default(),
            serde_json::to_string_pretty(&chunk_items).unwrap_or_default(),
            reference_list,
        )
    };

    // Etapa 5 (preparación): plantilla de respuesta.
    let template = if param.mode == QueryMode::Naive {
        prompts::NAIVE_RAG_RESPONSE
    } else {
        prompts::RAG_RESPONSE
    };
    let user_prompt_line = param
        .user_prompt
        .as_ref()
        .map(|p| format!("- {p}"))
        .unwrap_or_default();
    let history_text = param
        .conversation_history
        .iter()
        .map(|t| format!("{}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = render(
        template,
        &[
            ("context_data", &context_data),
            ("response_type", &param.response_type),
            ("user_prompt", &user_prompt_line),
            ("history", &history_text),
        ],
    );

    let raw_data = QueryRawData {
        entities: entity_items,
        relationships: relation_items,
        chunks: chunk_items,
        references,
        metadata: QueryMetadata {
            query_mode: param.mode.as_str().to_string(),
            keywords,
        },
    };

    Ok(Ok(AssembledContext { prompt, raw_data }))
}

/// Consulta completa: recuperación, ensamblado y generación. La señal
/// de cancelación se comprueba entre etapas; el paso en vuelo termina.
pub async fn rag_query(
    engine: &RagEngine,
    query: &str,
    param: QueryParam,
    cancel: &CancelFlag,
) -> Result<QueryResult> {
    if param.mode == QueryMode::Bypass {
        return Ok(fail_result(QueryMode::Bypass, QueryKeywords::default()));
    }
    if cancel.is_cancelled() {
        return Err(RagError::Cancelled);
    }

    let query_id = uuid::Uuid::new_v4();
    info!("Consulta {query_id} en modo {}", param.mode.as_str());

    let assembled = match build_query_context(engine, query, &param).await? {
        Ok(assembled) => assembled,
        Err(keywords) => {
            info!("Consulta {query_id} sin contexto utilizable");
            return Ok(fail_result(param.mode, keywords));
        }
    };

    if cancel.is_cancelled() {
        return Err(RagError::Cancelled);
    }

    if param.only_need_context {
        return Ok(QueryResult {
            response: String::new(),
            context: assembled.prompt,
            raw_data: assembled.raw_data,
        });
    }

    let response = match engine
        .llm
        .generate(&assembled.prompt, &GenerateOpts::default())
        .await
    {
        Ok(text) => text,
        Err(e) => {
            // El fallo del generador degrada a la respuesta reservada.
            warn!("Generación fallida tras agotar reintentos: {e}");
            FAIL_RESPONSE.to_string()
        }
    };

    Ok(QueryResult {
        response,
        context: assembled.prompt,
        raw_data: assembled.raw_data,
    })
}

/// Variante en streaming: el flujo del generador se propaga al llamante
/// sin buffering. Los datos crudos acompañan al flujo.
pub async fn rag_query_stream(
    engine: &RagEngine,
    query: &str,
    param: QueryParam,
) -> Result<(BoxStream<'static, Result<String>>, QueryRawData)> {
    use futures::StreamExt;

    if param.mode == QueryMode::Bypass {
        let raw = fail_result(QueryMode::Bypass, QueryKeywords::default()).raw_data;
        let stream =
            futures::stream::once(async { Ok(FAIL_RESPONSE.to_string()) }).boxed();
        return Ok((stream, raw));
    }

    let assembled = match build_query_context(engine, query, &param).await? {
        Ok(assembled) => assembled,
        Err(keywords) => {
            let raw = fail_result(param.mode, keywords).raw_data;
            let stream =
                futures::stream::once(async { Ok(FAIL_RESPONSE.to_string()) }).boxed();
            return Ok((stream, raw));
        }
    };

    let stream = engine
        .llm
        .generate_stream(&assembled.prompt, &GenerateOpts::default())
        .await?;
    Ok((stream, assembled.raw_data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_plan_matches_retrieval_table() {
        assert!(!plan_for(QueryMode::Bypass).entities);
        assert!(plan_for(QueryMode::Naive).chunks_direct);
        assert!(!plan_for(QueryMode::Naive).entities);
        assert!(plan_for(QueryMode::Local).chunks_via_entity);
        assert!(!plan_for(QueryMode::Local).relations);
        assert!(plan_for(QueryMode::Global).relations);
        assert!(!plan_for(QueryMode::Global).chunks_direct);
        let mix = plan_for(QueryMode::Mix);
        assert!(mix.entities && mix.relations && mix.chunks_direct && mix.chunks_via_entity);
    }

    #[test]
    fn first_json_object_is_extracted_tolerantly() {
        let response = "Claro, aquí tienes:\n{\"high_level_keywords\": [\"a\"], \"low_level_keywords\": []}\nGracias";
        let value = extract_first_json(response).unwrap();
        assert_eq!(value["high_level_keywords"][0], "a");
        assert!(extract_first_json("sin json").is_none());
    }
}
