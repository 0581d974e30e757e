//! Punto de entrada de línea de comandos del motor RAG.
//!
//! Uso:
//!   grafo_rag ingest <directorio>
//!   grafo_rag query <pregunta> [modo]
//!   grafo_rag delete <doc_id>
//!   grafo_rag graph [etiqueta]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use grafo_rag::models::QueryMode;
use grafo_rag::{AppConfig, CancelFlag, DeleteOptions, QueryParam, RagEngine};

fn parse_mode(raw: &str) -> Result<QueryMode> {
    match raw.to_lowercase().as_str() {
        "local" => Ok(QueryMode::Local),
        "global" => Ok(QueryMode::Global),
        "hybrid" => Ok(QueryMode::Hybrid),
        "naive" => Ok(QueryMode::Naive),
        "mix" => Ok(QueryMode::Mix),
        "bypass" => Ok(QueryMode::Bypass),
        other => Err(anyhow!("Modo de consulta no soportado: {other}")),
    }
}

fn usage() -> ! {
    eprintln!(
        "Uso:\n  grafo_rag ingest <directorio>\n  grafo_rag query <pregunta> [modo]\n  grafo_rag delete <doc_id>\n  grafo_rag graph [etiqueta]"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración y construir el motor
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;
    let engine = RagEngine::from_config(cfg)
        .await
        .context("Error inicializando el motor")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("ingest") => {
            let Some(dir) = args.get(1) else { usage() };
            let summary = grafo_rag::ingest::ingest_directory(
                &engine,
                Path::new(dir),
                &CancelFlag::new(),
            )
            .await?;
            println!("{summary}");
        }
        Some("query") => {
            let Some(question) = args.get(1) else { usage() };
            let mode = match args.get(2) {
                Some(raw) => parse_mode(raw)?,
                None => QueryMode::Mix,
            };
            let param = QueryParam {
                mode,
                ..QueryParam::default()
            };
            let result = engine.query(question, param).await?;
            println!("{}", result.response);
            info!(
                "Recuperadas {} entidades, {} relaciones y {} chunks",
                result.raw_data.entities.len(),
                result.raw_data.relationships.len(),
                result.raw_data.chunks.len()
            );
        }
        Some("delete") => {
            let Some(doc_id) = args.get(1) else { usage() };
            let report = engine
                .delete_document(doc_id, DeleteOptions::default())
                .await?;
            println!("{}", report.message);
        }
        Some("graph") => {
            let label = args.get(1).map(String::as_str).unwrap_or("*");
            let subgraph = engine.knowledge_subgraph(label, 2, 100).await?;
            for node in &subgraph.nodes {
                println!("{} [{}]", node.id, node.attrs.entity_type);
            }
            for edge in &subgraph.edges {
                println!("{} -- {} (peso {})", edge.source, edge.target, edge.attrs.weight);
            }
            if subgraph.truncated {
                println!("(subgrafo truncado)");
            }
        }
        _ => usage(),
    }

    Ok(())
}
