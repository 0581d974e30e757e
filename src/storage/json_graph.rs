//! Grafo de referencia respaldado por fichero JSON. El fichero tiene dos
//! claves de nivel superior, `nodes` y `edges`; las aristas se serializan
//! bajo la clave canónica `"a||b"` con los extremos ordenados
//! lexicográficamente. La adyacencia se reconstruye al cargar.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use super::{atomic_write_json, load_json, storage_file, GraphStorage};
use crate::error::Result;
use crate::models::{canonical_pair, EdgeAttrs, NodeAttrs};

const BACKEND: &str = "json_graph";

/// Separador de la clave de arista en el fichero.
const EDGE_KEY_SEP: &str = "||";

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphFile {
    nodes: HashMap<String, NodeAttrs>,
    edges: HashMap<String, EdgeAttrs>,
}

struct GraphState {
    nodes: HashMap<String, NodeAttrs>,
    edges: HashMap<String, EdgeAttrs>,
    adjacency: HashMap<String, HashSet<String>>,
    dirty: bool,
}

impl GraphState {
    fn rebuild_adjacency(&mut self) {
        self.adjacency.clear();
        let keys: Vec<String> = self.edges.keys().cloned().collect();
        for key in keys {
            match key.split_once(EDGE_KEY_SEP) {
                Some((a, b)) => {
                    self.adjacency
                        .entry(a.to_string())
                        .or_default()
                        .insert(b.to_string());
                    self.adjacency
                        .entry(b.to_string())
                        .or_default()
                        .insert(a.to_string());
                }
                None => warn!("Clave de arista malformada ignorada: {key}"),
            }
        }
    }

    fn link(&mut self, a: &str, b: &str) {
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    fn unlink(&mut self, a: &str, b: &str) {
        if let Some(set) = self.adjacency.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.adjacency.get_mut(b) {
            set.remove(a);
        }
    }
}

fn edge_key(a: &str, b: &str) -> String {
    let (x, y) = canonical_pair(a, b);
    format!("{x}{EDGE_KEY_SEP}{y}")
}

/// Grafo no dirigido en memoria con persistencia JSON atómica.
pub struct JsonGraphStorage {
    path: PathBuf,
    state: RwLock<GraphState>,
}

impl JsonGraphStorage {
    pub fn new(working_dir: &str, namespace: &str, name: &str) -> Result<Self> {
        let path = storage_file(working_dir, namespace, name);
        let file: GraphFile = load_json(&path, BACKEND)?.unwrap_or_default();
        let mut state = GraphState {
            nodes: file.nodes,
            edges: file.edges,
            adjacency: HashMap::new(),
            dirty: false,
        };
        state.rebuild_adjacency();
        Ok(JsonGraphStorage {
            path,
            state: RwLock::new(state),
        })
    }
}

#[async_trait]
impl GraphStorage for JsonGraphStorage {
    async fn has_node(&self, id: &str) -> Result<bool> {
        Ok(self.state.read().await.nodes.contains_key(id))
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>> {
        Ok(self.state.read().await.nodes.get(id).cloned())
    }

    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()> {
        let mut state = self.state.write().await;
        state.nodes.insert(id.to_string(), attrs);
        state.dirty = true;
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.nodes.remove(id).is_none() {
            return Ok(());
        }
        // Las aristas incidentes caen con el nodo.
        let neighbors: Vec<String> = state
            .adjacency
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for neighbor in &neighbors {
            state.edges.remove(&edge_key(id, neighbor));
            state.unlink(id, neighbor);
        }
        state.adjacency.remove(id);
        state.dirty = true;
        Ok(())
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.adjacency.get(id).map(|s| s.len()).unwrap_or(0))
    }

    async fn get_nodes_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, NodeAttrs>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id).map(|n| (id.clone(), n.clone())))
            .collect())
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<HashMap<String, usize>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    state.adjacency.get(id).map(|s| s.len()).unwrap_or(0),
                )
            })
            .collect())
    }

    async fn all_nodes(&self) -> Result<Vec<(String, NodeAttrs)>> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .iter()
            .map(|(id, attrs)| (id.clone(), attrs.clone()))
            .collect())
    }

    async fn all_labels(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.nodes.keys().cloned().collect())
    }

    async fn has_edge(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.state.read().await.edges.contains_key(&edge_key(a, b)))
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<EdgeAttrs>> {
        Ok(self.state.read().await.edges.get(&edge_key(a, b)).cloned())
    }

    async fn upsert_edge(&self, a: &str, b: &str, attrs: EdgeAttrs) -> Result<()> {
        let mut state = self.state.write().await;
        state.edges.insert(edge_key(a, b), attrs);
        state.link(a, b);
        state.dirty = true;
        Ok(())
    }

    async fn edges_of(&self, id: &str) -> Result<Vec<(String, String)>> {
        let state = self.state.read().await;
        let mut pairs: Vec<(String, String)> = state
            .adjacency
            .get(id)
            .map(|neighbors| {
                neighbors
                    .iter()
                    .map(|n| (id.to_string(), n.clone()))
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort();
        Ok(pairs)
    }

    async fn get_edges_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<(String, String), EdgeAttrs>> {
        let state = self.state.read().await;
        Ok(pairs
            .iter()
            .filter_map(|(a, b)| {
                state
                    .edges
                    .get(&edge_key(a, b))
                    .map(|attrs| (canonical_pair(a, b), attrs.clone()))
            })
            .collect())
    }

    async fn remove_edges(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut state = self.state.write().await;
        let mut removed = false;
        for (a, b) in pairs {
            if state.edges.remove(&edge_key(a, b)).is_some() {
                state.unlink(a, b);
                removed = true;
            }
        }
        if removed {
            state.dirty = true;
        }
        Ok(())
    }

    async fn all_edges(&self) -> Result<Vec<((String, String), EdgeAttrs)>> {
        let state = self.state.read().await;
        Ok(state
            .edges
            .iter()
            .filter_map(|(key, attrs)| {
                key.split_once(EDGE_KEY_SEP).map(|(a, b)| {
                    ((a.to_string(), b.to_string()), attrs.clone())
                })
            })
            .collect())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.dirty {
            return Ok(());
        }
        let file = GraphFile {
            nodes: state.nodes.clone(),
            edges: state.edges.clone(),
        };
        atomic_write_json(&self.path, &file, BACKEND)?;
        state.dirty = false;
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.nodes.clear();
        state.edges.clear();
        state.adjacency.clear();
        state.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(desc: &str) -> NodeAttrs {
        NodeAttrs {
            entity_type: "concept".to_string(),
            description: desc.to_string(),
            source_id: "chunk-x".to_string(),
            file_path: None,
        }
    }

    fn edge() -> EdgeAttrs {
        EdgeAttrs {
            weight: 1.0,
            description: "relacionados".to_string(),
            keywords: "k".to_string(),
            source_id: "chunk-x".to_string(),
        }
    }

    async fn star_graph(center: &str, leaves: usize) -> (tempfile::TempDir, JsonGraphStorage) {
        let dir = tempfile::tempdir().unwrap();
        let g = JsonGraphStorage::new(dir.path().to_str().unwrap(), "ns", "graph_data")
            .unwrap();
        g.upsert_node(center, node("centro")).await.unwrap();
        for i in 0..leaves {
            let leaf = format!("Hoja {i}");
            g.upsert_node(&leaf, node("hoja")).await.unwrap();
            g.upsert_edge(center, &leaf, edge()).await.unwrap();
        }
        (dir, g)
    }

    #[tokio::test]
    async fn degrees_follow_incident_edges() {
        // P6: tras añadir N aristas incidentes, degree(v) = N y
        // edge_degree(a,b) = degree(a) + degree(b).
        let (_dir, g) = star_graph("Centro", 4).await;
        assert_eq!(g.node_degree("Centro").await.unwrap(), 4);
        assert_eq!(g.node_degree("Hoja 0").await.unwrap(), 1);
        assert_eq!(g.edge_degree("Centro", "Hoja 0").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn edges_are_undirected_with_single_record() {
        let (_dir, g) = star_graph("Centro", 1).await;
        assert!(g.has_edge("Centro", "Hoja 0").await.unwrap());
        assert!(g.has_edge("Hoja 0", "Centro").await.unwrap());
        let e1 = g.get_edge("Centro", "Hoja 0").await.unwrap().unwrap();
        let e2 = g.get_edge("Hoja 0", "Centro").await.unwrap().unwrap();
        assert_eq!(e1, e2);
        assert_eq!(g.all_edges().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persisted_format_uses_canonical_edge_keys() {
        let dir = tempfile::tempdir().unwrap();
        let wd = dir.path().to_str().unwrap().to_string();
        {
            let g = JsonGraphStorage::new(&wd, "ns", "graph_data").unwrap();
            g.upsert_node("Zeta", node("z")).await.unwrap();
            g.upsert_node("Alfa", node("a")).await.unwrap();
            g.upsert_edge("Zeta", "Alfa", edge()).await.unwrap();
            GraphStorage::commit(&g).await.unwrap();
        }
        let raw = std::fs::read_to_string(
            storage_file(&wd, "ns", "graph_data"),
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["edges"].get("Alfa||Zeta").is_some());
        assert!(parsed["nodes"].get("Zeta").is_some());

        // La adyacencia se reconstruye al recargar.
        let g = JsonGraphStorage::new(&wd, "ns", "graph_data").unwrap();
        assert_eq!(g.node_degree("Zeta").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subgraph_respects_max_nodes_and_reports_truncation() {
        // P7: como mucho max_nodes nodos; truncated sii la frontera
        // quedó con nodos sin visitar; sin duplicados.
        let (_dir, g) = star_graph("Centro", 6).await;

        let full = g.knowledge_subgraph("Centro", 3, 50).await.unwrap();
        assert_eq!(full.nodes.len(), 7);
        assert_eq!(full.edges.len(), 6);
        assert!(!full.truncated);

        let cut = g.knowledge_subgraph("Centro", 3, 3).await.unwrap();
        assert_eq!(cut.nodes.len(), 3);
        assert!(cut.truncated);

        let ids: HashSet<_> = full.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids.len(), full.nodes.len());
    }

    #[tokio::test]
    async fn delete_node_drops_incident_edges() {
        let (_dir, g) = star_graph("Centro", 3).await;
        g.delete_node("Centro").await.unwrap();
        assert!(!g.has_node("Centro").await.unwrap());
        assert_eq!(g.all_edges().await.unwrap().len(), 0);
        assert_eq!(g.node_degree("Hoja 0").await.unwrap(), 0);
    }
}
