//! Extracción de entidades y relaciones de los chunks mediante el LLM,
//! con parseo tolerante del protocolo de líneas delimitadas.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{RagError, Result};
use crate::llm::{GenerateOpts, LlmManager};
use crate::models::canonical_pair;
use crate::prompts::{
    self, render, COMPLETE_SENTINEL, GRAPH_FIELD_SEP, TUPLE_DELIMITER,
};

/// Longitud máxima de un nombre de entidad tras la normalización.
const MAX_ENTITY_NAME_LEN: usize = 256;

/// Caracteres prohibidos en el tipo de entidad.
const FORBIDDEN_TYPE_CHARS: &[char] = &['\'', '(', ')', '<', '>', '|', '/', '\\'];

/// Entidad extraída de un chunk, aún sin fusionar.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub entity_name: String,
    pub entity_type: String,
    pub description: String,
    pub source_chunk_id: String,
}

/// Relación extraída de un chunk, aún sin fusionar.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub src_id: String,
    pub tgt_id: String,
    pub keywords: String,
    pub description: String,
    pub weight: f64,
    pub source_chunk_id: String,
}

/// Resultado de la extracción de un chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkExtraction {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

/// Elimina el separador reservado de procedencia del contenido entrante.
/// Tras la sanitización, `<SEP>` no aparece nunca en el corpus.
pub fn sanitize_content(content: &str) -> String {
    content.replace(GRAPH_FIELD_SEP, "")
}

/// Quita comillas exteriores (y dobles interiores) y colapsa espacios.
fn clean_str(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '“' || c == '”');
    let collapsed: Vec<&str> = trimmed.split_whitespace().collect();
    collapsed.join(" ").replace('"', "")
}

/// Pasa un nombre a formato título: primera letra de cada palabra en
/// mayúscula, el resto se conserva.
fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normaliza un nombre de entidad: limpieza, formato título y tope de
/// longitud. Devuelve `None` si queda vacío.
pub fn normalize_entity_name(raw: &str) -> Option<String> {
    let cleaned = clean_str(raw);
    if cleaned.is_empty() {
        return None;
    }
    let titled = title_case(&cleaned);
    Some(titled.chars().take(MAX_ENTITY_NAME_LEN).collect())
}

/// Parsea una línea con forma de registro de entidad. Devuelve `None`
/// (y deja un aviso en el log) ante cualquier campo inválido.
fn parse_entity_line(fields: &[&str], chunk_id: &str) -> Option<ExtractedEntity> {
    let entity_name = match normalize_entity_name(fields[1]) {
        Some(name) => name,
        None => {
            warn!("Entidad con nombre vacío descartada");
            return None;
        }
    };
    let entity_type = clean_str(fields[2]).to_lowercase().replace(' ', "");
    if entity_type.is_empty() || entity_type.chars().any(|c| FORBIDDEN_TYPE_CHARS.contains(&c)) {
        warn!("Entidad '{entity_name}' con tipo inválido descartada");
        return None;
    }
    let description = clean_str(fields[3]);
    if description.is_empty() {
        warn!("Entidad '{entity_name}' sin descripción descartada");
        return None;
    }
    Some(ExtractedEntity {
        entity_name,
        entity_type,
        description,
        source_chunk_id: chunk_id.to_string(),
    })
}

/// Parsea una línea con forma de registro de relación.
fn parse_relation_line(fields: &[&str], chunk_id: &str) -> Option<ExtractedRelation> {
    let src = normalize_entity_name(fields[1]);
    let tgt = normalize_entity_name(fields[2]);
    let (src_id, tgt_id) = match (src, tgt) {
        (Some(s), Some(t)) => (s, t),
        _ => {
            warn!("Relación con extremo vacío descartada");
            return None;
        }
    };
    if src_id == tgt_id {
        warn!("Relación reflexiva sobre '{src_id}' descartada");
        return None;
    }
    // Las comas de ancho completo se unifican al separador estándar.
    let keywords = clean_str(fields[3]).replace('，', ",");
    let description = clean_str(fields[4]);
    // Campo numérico final opcional con el peso.
    let weight = fields
        .get(5)
        .and_then(|raw| clean_str(raw).parse::<f64>().ok())
        .unwrap_or(1.0);
    Some(ExtractedRelation {
        src_id,
        tgt_id,
        keywords,
        description,
        weight,
        source_chunk_id: chunk_id.to_string(),
    })
}

/// Parsea la respuesta del LLM línea a línea. Los errores de una línea
/// nunca invalidan el chunk: la línea se descarta con un aviso.
pub fn parse_extraction_response(response: &str, chunk_id: &str) -> ChunkExtraction {
    let mut out = ChunkExtraction::default();
    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() || line == COMPLETE_SENTINEL {
            continue;
        }
        let fields: Vec<&str> = line.split(TUPLE_DELIMITER).map(str::trim).collect();
        let head = clean_str(fields[0]).to_lowercase();
        if fields.len() == 4 && head.contains("entity") {
            if let Some(entity) = parse_entity_line(&fields, chunk_id) {
                out.entities.push(entity);
            }
        } else if fields.len() >= 5 && head.contains("relation") {
            if let Some(relation) = parse_relation_line(&fields, chunk_id) {
                out.relations.push(relation);
            }
        } else {
            debug!("Línea de extracción ignorada: {line}");
        }
    }
    out
}

/// Extractor de conocimiento por chunk.
pub struct Extractor {
    llm: LlmManager,
    entity_types: String,
    language: String,
    max_gleaning: usize,
}

impl Extractor {
    pub fn new(cfg: &AppConfig, llm: LlmManager) -> Self {
        Extractor {
            llm,
            entity_types: cfg.entity_types.join(", "),
            language: cfg.language.clone(),
            max_gleaning: cfg.max_gleaning,
        }
    }

    fn system_prompt(&self) -> String {
        render(
            prompts::ENTITY_EXTRACTION,
            &[
                ("entity_types", &self.entity_types),
                ("tuple_delimiter", TUPLE_DELIMITER),
                ("completion_delimiter", COMPLETE_SENTINEL),
                ("language", &self.language),
            ],
        )
    }

    /// Extrae entidades y relaciones de un chunk, con hasta
    /// `max_gleaning` pasadas de repesca que concatenan registros
    /// nuevos. Los duplicados se resuelven en la fusión.
    pub async fn extract_chunk(
        &self,
        chunk_id: &str,
        content: &str,
    ) -> Result<ChunkExtraction> {
        let system = self.system_prompt();
        let user = render(prompts::ENTITY_EXTRACTION_USER, &[("input_text", content)]);

        let opts = GenerateOpts {
            system: Some(system),
            history: Vec::new(),
        };
        let response = self
            .llm
            .generate(&user, &opts)
            .await
            .map_err(|e| RagError::Extraction {
                chunk_id: chunk_id.to_string(),
                cause: e.to_string(),
            })?;
        let mut extraction = parse_extraction_response(&response, chunk_id);

        let mut history = vec![
            crate::models::ChatTurn {
                role: "user".to_string(),
                content: user.clone(),
            },
            crate::models::ChatTurn {
                role: "assistant".to_string(),
                content: response,
            },
        ];
        for pass in 0..self.max_gleaning {
            let continue_prompt = render(
                prompts::ENTITY_CONTINUE_EXTRACTION,
                &[("completion_delimiter", COMPLETE_SENTINEL)],
            );
            let opts = GenerateOpts {
                system: Some(self.system_prompt()),
                history: history.clone(),
            };
            let response = match self.llm.generate(&continue_prompt, &opts).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Pasada de repesca {} fallida para {chunk_id}: {e}", pass + 1);
                    break;
                }
            };
            let extra = parse_extraction_response(&response, chunk_id);
            if extra.entities.is_empty() && extra.relations.is_empty() {
                break;
            }
            extraction.entities.extend(extra.entities);
            extraction.relations.extend(extra.relations);
            history.push(crate::models::ChatTurn {
                role: "assistant".to_string(),
                content: response,
            });
        }

        debug!(
            "Chunk {chunk_id}: {} entidades, {} relaciones",
            extraction.entities.len(),
            extraction.relations.len()
        );
        Ok(extraction)
    }
}

/// Fragmentos agrupados listos para la fusión: por nombre de entidad y
/// por par de extremos canónico.
#[derive(Debug, Default)]
pub struct GroupedExtractions {
    pub entities: HashMap<String, Vec<ExtractedEntity>>,
    pub relations: HashMap<(String, String), Vec<ExtractedRelation>>,
}

/// Agrupa la salida de varios chunks por clave de fusión.
pub fn group_extractions(extractions: Vec<ChunkExtraction>) -> GroupedExtractions {
    let mut grouped = GroupedExtractions::default();
    for extraction in extractions {
        for entity in extraction.entities {
            grouped
                .entities
                .entry(entity.entity_name.clone())
                .or_default()
                .push(entity);
        }
        for relation in extraction.relations {
            let key = canonical_pair(&relation.src_id, &relation.tgt_id);
            grouped.relations.entry(key).or_default().push(relation);
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_lines_are_parsed_and_normalized() {
        let response = "entity<|#|>\"j.k. rowling\"<|#|>Person<|#|>Escritora británica.\n\
                        entity<|#|>harry potter<|#|>Content<|#|>Serie de novelas.\n\
                        <|COMPLETE|>";
        let out = parse_extraction_response(response, "chunk-1");
        assert_eq!(out.entities.len(), 2);
        assert_eq!(out.entities[0].entity_name, "J.k. Rowling");
        assert_eq!(out.entities[0].entity_type, "person");
        assert_eq!(out.entities[1].entity_name, "Harry Potter");
        assert!(out.relations.is_empty());
    }

    #[test]
    fn relation_lines_parse_weight_and_reject_self_loops() {
        let response = "relation<|#|>Einstein<|#|>Ulm<|#|>birth，origin<|#|>Nació allí.<|#|>2.5\n\
                        relation<|#|>A<|#|>A<|#|>x<|#|>reflexiva\n\
                        relation<|#|>A<|#|>B<|#|>x<|#|>sin peso";
        let out = parse_extraction_response(response, "chunk-1");
        assert_eq!(out.relations.len(), 2);
        assert_eq!(out.relations[0].weight, 2.5);
        assert_eq!(out.relations[0].keywords, "birth,origin");
        assert_eq!(out.relations[1].weight, 1.0);
    }

    #[test]
    fn malformed_lines_never_fail_the_chunk() {
        let response = "esto no es un registro\n\
                        entity<|#|><|#|>person<|#|>sin nombre\n\
                        entity<|#|>Nombre<|#|>ty(pe<|#|>desc\n\
                        entity<|#|>Válida<|#|>person<|#|>desc";
        let out = parse_extraction_response(response, "chunk-1");
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.entities[0].entity_name, "Válida");
    }

    #[test]
    fn sanitize_removes_reserved_separator() {
        assert_eq!(sanitize_content("a<SEP>b"), "ab");
    }

    #[test]
    fn grouping_uses_canonical_relation_keys() {
        let chunk = ChunkExtraction {
            entities: vec![],
            relations: vec![
                ExtractedRelation {
                    src_id: "B".into(),
                    tgt_id: "A".into(),
                    keywords: String::new(),
                    description: String::new(),
                    weight: 1.0,
                    source_chunk_id: "c1".into(),
                },
                ExtractedRelation {
                    src_id: "A".into(),
                    tgt_id: "B".into(),
                    keywords: String::new(),
                    description: String::new(),
                    weight: 1.0,
                    source_chunk_id: "c2".into(),
                },
            ],
        };
        let grouped = group_extractions(vec![chunk]);
        assert_eq!(grouped.relations.len(), 1);
        assert_eq!(
            grouped.relations[&("A".to_string(), "B".to_string())].len(),
            2
        );
    }
}
