//! Adaptador del grafo sobre Neo4j (protocolo bolt). Implementa el mismo
//! contrato que el backend de fichero; la durabilidad la da el servidor,
//! así que `commit()` es un no-op.
//!
//! Las aristas no dirigidas se materializan como una única relación
//! `:RELATED` creada siempre desde el extremo menor (orden lexicográfico)
//! hacia el mayor, y se consultan con patrones sin dirección.

use std::collections::HashMap;

use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::info;

use super::GraphStorage;
use crate::config::AppConfig;
use crate::error::{RagError, Result};
use crate::models::{canonical_pair, EdgeAttrs, NodeAttrs};

const BACKEND: &str = "neo4j_graph";

fn bolt_err(op: &'static str) -> impl Fn(neo4rs::Error) -> RagError {
    move |e| RagError::storage(BACKEND, op, e)
}

/// Grafo de conocimiento sobre un servidor Neo4j.
pub struct Neo4jGraphStorage {
    graph: Graph,
}

impl Neo4jGraphStorage {
    /// Conecta con las credenciales de la configuración y asegura el
    /// constraint de unicidad de entidades.
    pub async fn connect(cfg: &AppConfig) -> Result<Self> {
        let addr = cfg
            .neo4j_uri
            .trim_start_matches("bolt://")
            .trim_start_matches("neo4j://")
            .to_string();
        info!("Conectando a Neo4j en {addr}...");
        let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password)
            .await
            .map_err(bolt_err("connect"))?;
        graph
            .run(query(
                "CREATE CONSTRAINT entity_id IF NOT EXISTS
                 FOR (e:Entity)
                 REQUIRE e.id IS UNIQUE",
            ))
            .await
            .map_err(bolt_err("connect"))?;
        info!("Conexión a Neo4j OK");
        Ok(Neo4jGraphStorage { graph })
    }

    fn row_to_node(row: &neo4rs::Row) -> Option<(String, NodeAttrs)> {
        let id: String = row.get("id")?;
        let attrs = NodeAttrs {
            entity_type: row.get("entity_type").unwrap_or_default(),
            description: row.get("description").unwrap_or_default(),
            source_id: row.get("source_id").unwrap_or_default(),
            file_path: row.get("file_path"),
        };
        Some((id, attrs))
    }

    fn row_to_edge(row: &neo4rs::Row) -> Option<((String, String), EdgeAttrs)> {
        let a: String = row.get("a")?;
        let b: String = row.get("b")?;
        let attrs = EdgeAttrs {
            weight: row.get("weight").unwrap_or(0.0),
            description: row.get("description").unwrap_or_default(),
            keywords: row.get("keywords").unwrap_or_default(),
            source_id: row.get("source_id").unwrap_or_default(),
        };
        Some((canonical_pair(&a, &b), attrs))
    }
}

#[async_trait]
impl GraphStorage for Neo4jGraphStorage {
    async fn has_node(&self, id: &str) -> Result<bool> {
        let mut cursor = self
            .graph
            .execute(
                query("MATCH (e:Entity {id: $id}) RETURN e.id AS id")
                    .param("id", id.to_string()),
            )
            .await
            .map_err(bolt_err("has_node"))?;
        Ok(cursor
            .next()
            .await
            .map_err(bolt_err("has_node"))?
            .is_some())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeAttrs>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {id: $id})
                     RETURN e.id AS id, e.entity_type AS entity_type,
                            e.description AS description, e.source_id AS source_id,
                            e.file_path AS file_path",
                )
                .param("id", id.to_string()),
            )
            .await
            .map_err(bolt_err("get_node"))?;
        match cursor.next().await.map_err(bolt_err("get_node"))? {
            Some(row) => Ok(Self::row_to_node(&row).map(|(_, attrs)| attrs)),
            None => Ok(None),
        }
    }

    async fn upsert_node(&self, id: &str, attrs: NodeAttrs) -> Result<()> {
        self.graph
            .run(
                query(
                    "MERGE (e:Entity {id: $id})
                     SET e.entity_type = $entity_type, e.description = $description,
                         e.source_id = $source_id, e.file_path = $file_path",
                )
                .param("id", id.to_string())
                .param("entity_type", attrs.entity_type)
                .param("description", attrs.description)
                .param("source_id", attrs.source_id)
                .param("file_path", attrs.file_path.unwrap_or_default()),
            )
            .await
            .map_err(bolt_err("upsert_node"))
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        self.graph
            .run(
                query("MATCH (e:Entity {id: $id}) DETACH DELETE e")
                    .param("id", id.to_string()),
            )
            .await
            .map_err(bolt_err("delete_node"))
    }

    async fn node_degree(&self, id: &str) -> Result<usize> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {id: $id})
                     RETURN COUNT { (e)-[:RELATED]-() } AS degree",
                )
                .param("id", id.to_string()),
            )
            .await
            .map_err(bolt_err("node_degree"))?;
        match cursor.next().await.map_err(bolt_err("node_degree"))? {
            Some(row) => Ok(row.get::<i64>("degree").unwrap_or(0) as usize),
            None => Ok(0),
        }
    }

    async fn get_nodes_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, NodeAttrs>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity) WHERE e.id IN $ids
                     RETURN e.id AS id, e.entity_type AS entity_type,
                            e.description AS description, e.source_id AS source_id,
                            e.file_path AS file_path",
                )
                .param("ids", ids.to_vec()),
            )
            .await
            .map_err(bolt_err("get_nodes_batch"))?;
        let mut out = HashMap::new();
        while let Some(row) = cursor.next().await.map_err(bolt_err("get_nodes_batch"))? {
            if let Some((id, attrs)) = Self::row_to_node(&row) {
                out.insert(id, attrs);
            }
        }
        Ok(out)
    }

    async fn node_degrees_batch(&self, ids: &[String]) -> Result<HashMap<String, usize>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity) WHERE e.id IN $ids
                     RETURN e.id AS id, COUNT { (e)-[:RELATED]-() } AS degree",
                )
                .param("ids", ids.to_vec()),
            )
            .await
            .map_err(bolt_err("node_degrees_batch"))?;
        let mut out: HashMap<String, usize> =
            ids.iter().map(|id| (id.clone(), 0)).collect();
        while let Some(row) = cursor
            .next()
            .await
            .map_err(bolt_err("node_degrees_batch"))?
        {
            if let Some(id) = row.get::<String>("id") {
                out.insert(id, row.get::<i64>("degree").unwrap_or(0) as usize);
            }
        }
        Ok(out)
    }

    async fn all_nodes(&self) -> Result<Vec<(String, NodeAttrs)>> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (e:Entity)
                 RETURN e.id AS id, e.entity_type AS entity_type,
                        e.description AS description, e.source_id AS source_id,
                        e.file_path AS file_path",
            ))
            .await
            .map_err(bolt_err("all_nodes"))?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(bolt_err("all_nodes"))? {
            if let Some(pair) = Self::row_to_node(&row) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    async fn all_labels(&self) -> Result<Vec<String>> {
        let mut cursor = self
            .graph
            .execute(query("MATCH (e:Entity) RETURN e.id AS id"))
            .await
            .map_err(bolt_err("all_labels"))?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(bolt_err("all_labels"))? {
            if let Some(id) = row.get::<String>("id") {
                out.push(id);
            }
        }
        Ok(out)
    }

    async fn has_edge(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.get_edge(a, b).await?.is_some())
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<EdgeAttrs>> {
        let (x, y) = canonical_pair(a, b);
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (s:Entity {id: $a})-[r:RELATED]-(t:Entity {id: $b})
                     RETURN s.id AS a, t.id AS b, r.weight AS weight,
                            r.description AS description, r.keywords AS keywords,
                            r.source_id AS source_id",
                )
                .param("a", x)
                .param("b", y),
            )
            .await
            .map_err(bolt_err("get_edge"))?;
        match cursor.next().await.map_err(bolt_err("get_edge"))? {
            Some(row) => Ok(Self::row_to_edge(&row).map(|(_, attrs)| attrs)),
            None => Ok(None),
        }
    }

    async fn upsert_edge(&self, a: &str, b: &str, attrs: EdgeAttrs) -> Result<()> {
        let (x, y) = canonical_pair(a, b);
        self.graph
            .run(
                query(
                    "MATCH (s:Entity {id: $a}), (t:Entity {id: $b})
                     MERGE (s)-[r:RELATED]->(t)
                     SET r.weight = $weight, r.description = $description,
                         r.keywords = $keywords, r.source_id = $source_id",
                )
                .param("a", x)
                .param("b", y)
                .param("weight", attrs.weight)
                .param("description", attrs.description)
                .param("keywords", attrs.keywords)
                .param("source_id", attrs.source_id),
            )
            .await
            .map_err(bolt_err("upsert_edge"))
    }

    async fn edges_of(&self, id: &str) -> Result<Vec<(String, String)>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {id: $id})-[:RELATED]-(n:Entity)
                     RETURN n.id AS neighbor ORDER BY neighbor",
                )
                .param("id", id.to_string()),
            )
            .await
            .map_err(bolt_err("edges_of"))?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(bolt_err("edges_of"))? {
            if let Some(neighbor) = row.get::<String>("neighbor") {
                out.push((id.to_string(), neighbor));
            }
        }
        Ok(out)
    }

    async fn get_edges_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<(String, String), EdgeAttrs>> {
        let mut out = HashMap::new();
        for (a, b) in pairs {
            if let Some(attrs) = self.get_edge(a, b).await? {
                out.insert(canonical_pair(a, b), attrs);
            }
        }
        Ok(out)
    }

    async fn remove_edges(&self, pairs: &[(String, String)]) -> Result<()> {
        for (a, b) in pairs {
            self.graph
                .run(
                    query(
                        "MATCH (s:Entity {id: $a})-[r:RELATED]-(t:Entity {id: $b})
                         DELETE r",
                    )
                    .param("a", a.clone())
                    .param("b", b.clone()),
                )
                .await
                .map_err(bolt_err("remove_edges"))?;
        }
        Ok(())
    }

    async fn all_edges(&self) -> Result<Vec<((String, String), EdgeAttrs)>> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (s:Entity)-[r:RELATED]->(t:Entity)
                 RETURN s.id AS a, t.id AS b, r.weight AS weight,
                        r.description AS description, r.keywords AS keywords,
                        r.source_id AS source_id",
            ))
            .await
            .map_err(bolt_err("all_edges"))?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(bolt_err("all_edges"))? {
            if let Some(pair) = Self::row_to_edge(&row) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    async fn commit(&self) -> Result<()> {
        // El servidor es durable por transacción.
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        self.graph
            .run(query("MATCH (e:Entity) DETACH DELETE e"))
            .await
            .map_err(bolt_err("drop_all"))
    }
}
