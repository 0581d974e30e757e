//! Índice vectorial de referencia sobre fichero JSON: coseno lineal
//! sobre el conjunto de candidatos, con umbral y ordenación estable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{atomic_write_json, load_json, storage_file, VectorStorage};
use crate::error::{RagError, Result};
use crate::llm::Embedder;
use crate::models::{VectorHit, VectorRecord};

const BACKEND: &str = "json_vector";

/// Similitud coseno entre dos vectores. Devuelve 0 para vectores nulos
/// o de dimensiones distintas.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

struct VectorState {
    records: HashMap<String, VectorRecord>,
    dirty: bool,
}

/// Almacén vectorial respaldado por un único objeto JSON `{id -> registro}`.
pub struct JsonVectorStorage {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    state: RwLock<VectorState>,
}

impl JsonVectorStorage {
    pub fn new(
        working_dir: &str,
        namespace: &str,
        name: &str,
        embedder: Arc<dyn Embedder>,
        threshold: f32,
    ) -> Result<Self> {
        let path = storage_file(working_dir, namespace, name);
        let records: HashMap<String, VectorRecord> =
            load_json(&path, BACKEND)?.unwrap_or_default();
        Ok(JsonVectorStorage {
            path,
            embedder,
            threshold,
            state: RwLock::new(VectorState {
                records,
                dirty: false,
            }),
        })
    }

    fn metadata_matches(record: &VectorRecord, key: &str, value: &str) -> bool {
        record
            .metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(|v| v == value)
            .unwrap_or(false)
    }
}

#[async_trait]
impl VectorStorage for JsonVectorStorage {
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        precomputed: Option<&[f32]>,
    ) -> Result<Vec<VectorHit>> {
        let owned_embedding;
        let query_vec: &[f32] = match precomputed {
            Some(vec) => vec,
            None => {
                let mut vectors = self.embedder.embed(&[text.to_string()]).await?;
                owned_embedding = vectors.pop().ok_or_else(|| RagError::Embedding {
                    text_count: 1,
                    cause: "el embedder devolvió un lote vacío".to_string(),
                })?;
                &owned_embedding
            }
        };

        let state = self.state.read().await;
        let mut hits: Vec<VectorHit> = state
            .records
            .values()
            .map(|record| VectorHit {
                id: record.id.clone(),
                score: cosine_similarity(query_vec, &record.embedding),
                record: record.clone(),
            })
            .filter(|hit| hit.score >= self.threshold)
            .collect();

        // Orden descendente por puntuación; empates por id para que la
        // salida sea determinista.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        for record in records {
            state.records.insert(record.id.clone(), record);
        }
        state.dirty = true;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        let mut removed = false;
        for id in ids {
            removed |= state.records.remove(id).is_some();
        }
        if removed {
            state.dirty = true;
        }
        Ok(())
    }

    async fn delete_by_entity(&self, entity_name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let before = state.records.len();
        state
            .records
            .retain(|_, r| !Self::metadata_matches(r, "entity_name", entity_name));
        if state.records.len() != before {
            state.dirty = true;
        }
        Ok(())
    }

    async fn delete_by_entity_relation(&self, entity_name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let before = state.records.len();
        state.records.retain(|_, r| {
            !Self::metadata_matches(r, "src_id", entity_name)
                && !Self::metadata_matches(r, "tgt_id", entity_name)
        });
        if state.records.len() != before {
            state.dirty = true;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Option<VectorRecord>>> {
        let state = self.state.read().await;
        Ok(ids.iter().map(|id| state.records.get(id).cloned()).collect())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.dirty {
            return Ok(());
        }
        atomic_write_json(&self.path, &state.records, BACKEND)?;
        state.dirty = false;
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.records.clear();
        state.dirty = true;
        Ok(())
    }
}
