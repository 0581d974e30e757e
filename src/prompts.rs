//! Plantillas de prompt y constantes del protocolo de extracción.
//!
//! Los prompts son datos del motor: se formatean con `render`, que
//! sustituye marcadores `{nombre}`. Las constantes del protocolo
//! (delimitador de tuplas, centinela de fin, separador de procedencia)
//! son fijas para toda la vida del corpus.

/// Separador reservado entre ids de chunk dentro de `source_id`.
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

/// Delimitador de campos dentro de una línea de extracción.
pub const TUPLE_DELIMITER: &str = "<|#|>";

/// Centinela que marca el final de la salida de extracción.
pub const COMPLETE_SENTINEL: &str = "<|COMPLETE|>";

/// Respuesta literal reservada cuando no hay contexto utilizable.
pub const FAIL_RESPONSE: &str =
    "Sorry, I'm not able to provide an answer to that question.[no-context]";

/// Sustituye cada `{clave}` de la plantilla por su valor.
pub fn render(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Prompt de sistema para la extracción de entidades y relaciones.
/// Parámetros: `entity_types`, `tuple_delimiter`, `completion_delimiter`,
/// `language`.
pub const ENTITY_EXTRACTION: &str = r#"---Goal---
Given a text document, identify all entities of the listed types and all relationships among the identified entities. Use {language} as output language.

---Steps---
1. Identify all entities. For each, extract:
- entity_name: name of the entity, capitalized like a proper title
- entity_type: one of the following types: [{entity_types}]
- entity_description: comprehensive description of the entity's attributes and activities, based only on the input text
Format each entity as a single line:
entity{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are clearly related to each other. For each pair, extract:
- source_entity and target_entity: the names as identified in step 1
- relationship_keywords: high-level keywords summarizing the nature of the relationship, comma separated
- relationship_description: why the source and target entities are related
Format each relationship as a single line:
relation{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_keywords>{tuple_delimiter}<relationship_description>

3. Return all entity and relationship lines. When finished, output {completion_delimiter}

---Real Data---
"#;

/// Prompt de usuario con el contenido del chunk.
pub const ENTITY_EXTRACTION_USER: &str = r#"Text:
{input_text}

Output:
"#;

/// Prompt de continuación para pasadas de repesca (gleaning).
pub const ENTITY_CONTINUE_EXTRACTION: &str = r#"Many entities and relationships were missed in the last extraction. Add the missing ones below using the same line format. Do not repeat entities or relationships already extracted. When finished, output {completion_delimiter}

Output:
"#;

/// Prompt para resumir una lista de descripciones de una misma entidad
/// o relación. Parámetros: `entity_name`, `description_list`, `language`,
/// `summary_length`.
pub const SUMMARIZE_DESCRIPTIONS: &str = r#"You are a helpful assistant responsible for generating a single comprehensive summary of the data below.
Given one entity or relationship and a list of descriptions, all related to the same entity or relationship, concatenate them into a single, coherent description written in third person that includes the entity names for full context. Resolve any contradictions. Keep the summary under {summary_length} tokens. Use {language} as output language.

Entity or relationship: {entity_name}
Description list:
{description_list}

Output:
"#;

/// Prompt de elicitación de palabras clave. Parámetro: `query`.
pub const KEYWORDS_EXTRACTION: &str = r#"---Role---
You are a helpful assistant tasked with identifying both high-level and low-level keywords in the user's query.

---Goal---
Given the query, list both high-level keywords (overarching concepts or themes) and low-level keywords (specific entities or details).

---Instructions---
Output ONLY a JSON object with two keys:
- "high_level_keywords" for overarching concepts or themes
- "low_level_keywords" for specific entities or details

Query: {query}

Output:
"#;

/// Prompt de respuesta RAG con contexto de grafo. Parámetros:
/// `context_data`, `response_type`, `user_prompt`, `history`.
pub const RAG_RESPONSE: &str = r#"---Role---
You are a helpful assistant responding to the user query using the Knowledge Base provided below.

---Goal---
Generate a concise response based on the Knowledge Base, considering both the content and the conversation history. Do not include information not provided by the Knowledge Base. If you don't know the answer, just say so.

---Conversation History---
{history}

---Knowledge Base---
{context_data}

---Response Rules---
- Target format and length: {response_type}
- Use markdown formatting with section headings where appropriate
- Cite sources using the reference numbers of the document chunks, e.g. [1]
{user_prompt}
"#;

/// Variante ingenua de la respuesta RAG: sólo chunks de documento.
pub const NAIVE_RAG_RESPONSE: &str = r#"---Role---
You are a helpful assistant responding to the user query using the Document Chunks provided below.

---Goal---
Generate a concise response based on the Document Chunks, considering both the content and the conversation history. Do not include information not provided by the Document Chunks. If you don't know the answer, just say so.

---Conversation History---
{history}

---Document Chunks---
{context_data}

---Response Rules---
- Target format and length: {response_type}
- Cite sources using the reference numbers of the document chunks, e.g. [1]
{user_prompt}
"#;
