//! Implementaciones de referencia respaldadas por fichero JSON del
//! almacén clave-valor y del estado de documentos.
//!
//! El estado en memoria es la autoridad durante la sesión; un bit de
//! suciedad provoca una única escritura atómica en `commit()`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use super::{atomic_write_json, load_json, storage_file, DocStatusStorage, KvStorage};
use crate::error::Result;
use crate::models::{iso_now, DocRecord, DocStatus};

const BACKEND: &str = "json_kv";
const STATUS_BACKEND: &str = "json_doc_status";

struct KvState {
    data: HashMap<String, Value>,
    dirty: bool,
}

/// KV genérico sobre un único objeto JSON `{id -> valor}`.
pub struct JsonKvStorage {
    path: PathBuf,
    state: RwLock<KvState>,
}

impl JsonKvStorage {
    pub fn new(working_dir: &str, namespace: &str, name: &str) -> Result<Self> {
        let path = storage_file(working_dir, namespace, name);
        let data: HashMap<String, Value> =
            load_json(&path, BACKEND)?.unwrap_or_default();
        if !data.is_empty() {
            info!("KV '{}' cargado con {} registros", path.display(), data.len());
        }
        Ok(JsonKvStorage {
            path,
            state: RwLock::new(KvState { data, dirty: false }),
        })
    }
}

#[async_trait]
impl KvStorage for JsonKvStorage {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.state.read().await.data.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let state = self.state.read().await;
        Ok(ids.iter().map(|id| state.data.get(id).cloned()).collect())
    }

    async fn missing_keys(&self, ids: &HashSet<String>) -> Result<HashSet<String>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter(|id| !state.data.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn upsert(&self, data: HashMap<String, Value>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        state.data.extend(data);
        state.dirty = true;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        let mut removed = false;
        for id in ids {
            removed |= state.data.remove(id).is_some();
        }
        if removed {
            state.dirty = true;
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.state.read().await.data.is_empty())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.dirty {
            return Ok(());
        }
        atomic_write_json(&self.path, &state.data, BACKEND)?;
        state.dirty = false;
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.data.clear();
        state.dirty = true;
        Ok(())
    }
}

struct StatusState {
    data: HashMap<String, DocRecord>,
    dirty: bool,
}

/// Estado de documentos sobre fichero JSON, con marcas de tiempo
/// mantenidas automáticamente en cada upsert.
pub struct JsonDocStatusStorage {
    path: PathBuf,
    state: RwLock<StatusState>,
}

impl JsonDocStatusStorage {
    pub fn new(working_dir: &str, namespace: &str, name: &str) -> Result<Self> {
        let path = storage_file(working_dir, namespace, name);
        let data: HashMap<String, DocRecord> =
            load_json(&path, STATUS_BACKEND)?.unwrap_or_default();
        Ok(JsonDocStatusStorage {
            path,
            state: RwLock::new(StatusState { data, dirty: false }),
        })
    }

    async fn update_doc<F>(&self, doc_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DocRecord),
    {
        let mut state = self.state.write().await;
        if let Some(record) = state.data.get_mut(doc_id) {
            mutate(record);
            record.updated_at = iso_now();
            state.dirty = true;
        }
        Ok(())
    }
}

#[async_trait]
impl DocStatusStorage for JsonDocStatusStorage {
    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        Ok(self.state.read().await.data.get(doc_id).cloned())
    }

    async fn upsert_doc(&self, mut record: DocRecord) -> Result<()> {
        let mut state = self.state.write().await;
        // `created_at` se conserva si el documento ya existía.
        if let Some(existing) = state.data.get(&record.doc_id) {
            record.created_at = existing.created_at.clone();
        }
        record.updated_at = iso_now();
        state.data.insert(record.doc_id.clone(), record);
        state.dirty = true;
        Ok(())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.data.remove(doc_id).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocRecord>> {
        let state = self.state.read().await;
        Ok(state
            .data
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn is_processed(&self, doc_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .data
            .get(doc_id)
            .map(|r| r.status == DocStatus::Processed)
            .unwrap_or(false))
    }

    async fn mark_processing(&self, doc_id: &str) -> Result<()> {
        self.update_doc(doc_id, |r| {
            r.status = DocStatus::Processing;
            r.error_msg = None;
        })
        .await
    }

    async fn mark_processed(
        &self,
        doc_id: &str,
        chunks_count: usize,
        chunk_ids: Vec<String>,
    ) -> Result<()> {
        self.update_doc(doc_id, |r| {
            r.status = DocStatus::Processed;
            r.chunks_count = Some(chunks_count);
            r.chunk_ids = Some(chunk_ids);
            r.error_msg = None;
        })
        .await
    }

    async fn mark_failed(&self, doc_id: &str, error_msg: &str) -> Result<()> {
        self.update_doc(doc_id, |r| {
            r.status = DocStatus::Failed;
            r.error_msg = Some(error_msg.to_string());
        })
        .await
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.dirty {
            return Ok(());
        }
        atomic_write_json(&self.path, &state.data, STATUS_BACKEND)?;
        state.dirty = false;
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.data.clear();
        state.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_kv() -> (tempfile::TempDir, JsonKvStorage) {
        let dir = tempfile::tempdir().unwrap();
        let kv =
            JsonKvStorage::new(dir.path().to_str().unwrap(), "test", "chunks").unwrap();
        (dir, kv)
    }

    #[tokio::test]
    async fn upsert_get_and_missing_keys() {
        let (_dir, kv) = tmp_kv();
        assert!(kv.is_empty().await.unwrap());
        kv.upsert(HashMap::from([
            ("a".to_string(), json!({"v": 1})),
            ("b".to_string(), json!({"v": 2})),
        ]))
        .await
        .unwrap();

        assert_eq!(kv.get("a").await.unwrap().unwrap()["v"], 1);
        assert!(kv.get("zz").await.unwrap().is_none());

        let wanted: HashSet<String> =
            ["a", "c"].iter().map(|s| s.to_string()).collect();
        let missing = kv.missing_keys(&wanted).await.unwrap();
        assert_eq!(missing, HashSet::from(["c".to_string()]));
    }

    #[tokio::test]
    async fn commit_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let wd = dir.path().to_str().unwrap().to_string();
        {
            let kv = JsonKvStorage::new(&wd, "ns", "docs").unwrap();
            kv.upsert(HashMap::from([("k".to_string(), json!("v"))]))
                .await
                .unwrap();
            kv.commit().await.unwrap();
            // Doble commit sin mutación: no-op.
            kv.commit().await.unwrap();
        }
        let reloaded = JsonKvStorage::new(&wd, "ns", "docs").unwrap();
        assert_eq!(reloaded.get("k").await.unwrap().unwrap(), json!("v"));
    }

    #[tokio::test]
    async fn doc_status_lifecycle_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDocStatusStorage::new(
            dir.path().to_str().unwrap(),
            "ns",
            "doc_status",
        )
        .unwrap();

        let record = DocRecord::new("doc-1", "contenido", Some("f.txt"));
        let created = record.created_at.clone();
        store.upsert_doc(record).await.unwrap();
        store.mark_processing("doc-1").await.unwrap();
        store
            .mark_processed("doc-1", 2, vec!["c1".into(), "c2".into()])
            .await
            .unwrap();

        let doc = store.get_doc("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Processed);
        assert_eq!(doc.chunks_count, Some(2));
        assert_eq!(doc.created_at, created);
        assert!(store.is_processed("doc-1").await.unwrap());

        store.mark_failed("doc-1", "boom").await.unwrap();
        let failed = store.by_status(DocStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_msg.as_deref(), Some("boom"));
    }
}
