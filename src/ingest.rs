//! Pipeline de ingesta: normalización, chunking, embeddings, extracción
//! de conocimiento y fusión en el grafo, con el ciclo de estados
//! `pending → processing → processed | failed` y contención de fallos
//! por documento.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use futures::stream::{self, StreamExt};
use mime_guess::MimeGuess;
use serde_json::json;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::chunker::{chunk_text, ChunkOptions};
use crate::engine::{CancelFlag, RagEngine};
use crate::error::{RagError, Result};
use crate::extract::{group_extractions, sanitize_content, ChunkExtraction};
use crate::models::{compute_chunk_id, compute_doc_id, ChunkRecord, DocRecord, VectorRecord};
use crate::storage::{DocStatusStorage, KvStorage, VectorStorage};

/// Resumen de los resultados de una operación de ingesta de directorio.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub chunks_created: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos, {} chunks creados.",
            self.files_scanned, self.files_ingested, self.files_skipped, self.chunks_created
        )
    }
}

/// Ingesta un documento de principio a fin. Reingerir un documento ya
/// `processed` es un no-op; un documento `failed` reinicia el pipeline.
pub async fn ingest_document(
    engine: &RagEngine,
    content: &str,
    file_path: Option<&str>,
    cancel: &CancelFlag,
) -> Result<String> {
    let normalized = sanitize_content(content.trim());
    if normalized.is_empty() {
        return Err(RagError::Configuration {
            param: "content",
            value: "(documento vacío)".to_string(),
        });
    }

    let doc_id = compute_doc_id(&normalized);
    if engine.stores.doc_status.is_processed(&doc_id).await? {
        info!("Documento {doc_id} ya procesado; ingesta omitida");
        return Ok(doc_id);
    }

    // Un permiso por pipeline de documento (`max_parallel_insert`).
    let _permit = engine
        .insert_pool
        .acquire()
        .await
        .map_err(|e| RagError::storage("engine", "insert", e))?;

    engine
        .stores
        .doc_status
        .upsert_doc(DocRecord::new(&doc_id, &normalized, file_path))
        .await?;
    engine
        .stores
        .docs_kv
        .upsert(HashMap::from([(
            doc_id.clone(),
            json!({ "content": normalized }),
        )]))
        .await?;
    engine.stores.doc_status.mark_processing(&doc_id).await?;

    match run_pipeline(engine, &doc_id, &normalized, file_path, cancel).await {
        Ok(chunk_ids) => {
            engine
                .stores
                .doc_status
                .mark_processed(&doc_id, chunk_ids.len(), chunk_ids)
                .await?;
            engine.stores.commit_all().await?;
            info!("Documento {doc_id} procesado");
            Ok(doc_id)
        }
        Err(RagError::Cancelled) => {
            // El estado queda en `processing`; una reingesta posterior
            // retomará el documento.
            engine.stores.doc_status.commit().await?;
            Err(RagError::Cancelled)
        }
        Err(e) => {
            engine
                .stores
                .doc_status
                .mark_failed(&doc_id, &e.to_string())
                .await?;
            engine.stores.doc_status.commit().await?;
            error!("Documento {doc_id} fallido: {e}");
            Err(e)
        }
    }
}

fn ensure_not_cancelled(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RagError::Cancelled)
    } else {
        Ok(())
    }
}

/// Pasos del pipeline con el orden garantizado: chunking, embeddings,
/// upsert de chunks, extracción y fusión.
async fn run_pipeline(
    engine: &RagEngine,
    doc_id: &str,
    content: &str,
    file_path: Option<&str>,
    cancel: &CancelFlag,
) -> Result<Vec<String>> {
    ensure_not_cancelled(cancel)?;

    let opts = ChunkOptions {
        chunk_tokens: engine.cfg.chunk_token_size,
        overlap_tokens: engine.cfg.chunk_overlap_token_size,
        ..ChunkOptions::default()
    };
    let pieces = chunk_text(engine.tokenizer.as_ref(), content, &opts)?;

    let mut chunk_ids = Vec::with_capacity(pieces.len());
    let mut records: Vec<(String, ChunkRecord)> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let chunk_id = compute_chunk_id(&piece.content);
        chunk_ids.push(chunk_id.clone());
        records.push((
            chunk_id,
            ChunkRecord {
                content: piece.content,
                tokens: piece.tokens,
                full_doc_id: doc_id.to_string(),
                chunk_order_index: piece.chunk_order_index,
                file_path: file_path.map(str::to_string),
            },
        ));
    }

    // Los chunks ya presentes (contenido idéntico, quizá de otro
    // documento) no se vuelven a embeber ni a extraer.
    let wanted: HashSet<String> = chunk_ids.iter().cloned().collect();
    let missing = engine.stores.chunks_kv.missing_keys(&wanted).await?;
    let new_records: Vec<&(String, ChunkRecord)> = records
        .iter()
        .filter(|(id, _)| missing.contains(id))
        .collect();

    ensure_not_cancelled(cancel)?;

    if !new_records.is_empty() {
        let texts: Vec<String> = new_records
            .iter()
            .map(|(_, r)| r.content.clone())
            .collect();
        let vectors = engine.llm.embed(&texts).await?;
        let vector_records: Vec<VectorRecord> = new_records
            .iter()
            .zip(vectors)
            .map(|((id, record), embedding)| VectorRecord {
                id: id.clone(),
                embedding,
                content: Some(record.content.clone()),
                metadata: [
                    ("doc_id".to_string(), json!(record.full_doc_id)),
                    ("file_path".to_string(), json!(record.file_path)),
                ]
                .into_iter()
                .collect(),
            })
            .collect();
        engine.stores.chunks_vdb.upsert(vector_records).await?;

        let kv_payload: HashMap<String, serde_json::Value> = new_records
            .iter()
            .map(|(id, record)| {
                (id.clone(), serde_json::to_value(record).unwrap_or_default())
            })
            .collect();
        engine.stores.chunks_kv.upsert(kv_payload).await?;
    }

    ensure_not_cancelled(cancel)?;

    // Extracción por chunk, acotada por el pool del LLM. El fallo de un
    // chunk se registra y se omite; el documento continúa.
    let extractions: Vec<ChunkExtraction> = stream::iter(new_records.iter())
        .map(|(id, record)| {
            let extractor = &engine.extractor;
            async move {
                match extractor.extract_chunk(id, &record.content).await {
                    Ok(extraction) => Some(extraction),
                    Err(e) => {
                        warn!("Extracción omitida: {e}");
                        None
                    }
                }
            }
        })
        .buffer_unordered(engine.cfg.max_async)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect();

    ensure_not_cancelled(cancel)?;

    engine.merger.merge_all(group_extractions(extractions)).await?;

    Ok(chunk_ids)
}

/// Ingesta un lote; cada documento corre en su propio pipeline acotado
/// por `max_parallel_insert`. Los errores se devuelven por posición.
pub async fn ingest_batch(
    engine: &RagEngine,
    docs: Vec<(String, Option<String>)>,
    cancel: &CancelFlag,
) -> Vec<Result<String>> {
    let futures = docs.iter().map(|(content, file_path)| {
        ingest_document(engine, content, file_path.as_deref(), cancel)
    });
    futures::future::join_all(futures).await
}

/// Lee el texto de un fichero soportado; `None` si se omite.
fn read_file_text(path: &Path) -> Option<String> {
    let extension = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "pdf" => match pdf_extract::extract_text(path) {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(
                    "No se pudo extraer texto del PDF {}: {e}. Saltando fichero.",
                    path.display()
                );
                None
            }
        },
        "txt" | "md" | "rs" | "toml" | "log" | "html" | "css" | "js" => {
            match fs::read_to_string(path) {
                Ok(content) => Some(content),
                Err(_) => {
                    warn!("Saltando fichero no-texto o no-UTF8: {}", path.display());
                    None
                }
            }
        }
        _ => {
            // Último intento: tipos `text/*` según el MIME adivinado.
            let mime: MimeGuess = MimeGuess::from_path(path);
            let is_text = mime
                .first()
                .map(|m| m.type_() == mime_guess::mime::TEXT)
                .unwrap_or(false);
            if is_text {
                fs::read_to_string(path).ok()
            } else {
                info!(
                    "Saltando fichero con extensión no soportada ('.{extension}'): {}",
                    path.display()
                );
                None
            }
        }
    }
}

/// Recorre recursivamente un directorio e ingesta cada fichero de texto
/// o PDF. Los errores por fichero se registran y no detienen el lote.
pub async fn ingest_directory(
    engine: &RagEngine,
    root: &Path,
    cancel: &CancelFlag,
) -> Result<IngestionSummary> {
    if !root.is_dir() {
        return Err(RagError::Configuration {
            param: "ingest_dir",
            value: format!("no es un directorio: {}", root.display()),
        });
    }

    let mut summary = IngestionSummary::default();
    let file_entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    for entry in &file_entries {
        ensure_not_cancelled(cancel)?;
        summary.files_scanned += 1;
        let path = entry.path();

        let Some(text) = read_file_text(path) else {
            summary.files_skipped += 1;
            continue;
        };
        if text.trim().is_empty() {
            warn!("Fichero vacío o sin texto útil: {}", path.display());
            summary.files_skipped += 1;
            continue;
        }

        let file_path = path.to_string_lossy().to_string();
        match ingest_document(engine, &text, Some(&file_path), cancel).await {
            Ok(doc_id) => {
                summary.files_ingested += 1;
                if let Some(doc) = engine.stores.doc_status.get_doc(&doc_id).await? {
                    summary.chunks_created += doc.chunks_count.unwrap_or(0);
                }
            }
            Err(RagError::Cancelled) => return Err(RagError::Cancelled),
            Err(e) => {
                summary.files_skipped += 1;
                error!("Error ingiriendo {}: {e}", path.display());
            }
        }
    }

    info!("{summary}");
    Ok(summary)
}
