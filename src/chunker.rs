//! Troceado de documentos en ventanas acotadas por tokens, con solape
//! configurable y un modo opcional que respeta un separador.

use tracing::warn;

use crate::error::{RagError, Result};
use crate::tokenizer::Tokenizer;

/// Opciones del chunker.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
    /// Si está presente, se divide primero por este separador.
    pub split_by_character: Option<String>,
    /// Con separador: falla en vez de subdividir segmentos demasiado largos.
    pub split_by_character_only: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        ChunkOptions {
            chunk_tokens: 1200,
            overlap_tokens: 100,
            split_by_character: None,
            split_by_character_only: false,
        }
    }
}

/// Una pieza emitida por el chunker, aún sin id de contenido.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub tokens: usize,
    pub content: String,
    pub chunk_order_index: usize,
}

/// Trocea `content` según las opciones. El índice de orden es secuencial
/// sobre todas las piezas emitidas.
pub fn chunk_text(
    tokenizer: &dyn Tokenizer,
    content: &str,
    opts: &ChunkOptions,
) -> Result<Vec<ChunkPiece>> {
    if opts.overlap_tokens >= opts.chunk_tokens {
        return Err(RagError::Configuration {
            param: "chunk_overlap_token_size",
            value: format!(
                "{} (debe ser menor que chunk_token_size={})",
                opts.overlap_tokens, opts.chunk_tokens
            ),
        });
    }

    let mut pieces = Vec::new();

    match &opts.split_by_character {
        None => {
            let tokens = tokenizer.encode(content);
            append_token_windows(tokenizer, &tokens, opts, &mut pieces);
        }
        Some(sep) => {
            for segment in content.split(sep.as_str()) {
                let segment = segment.trim();
                if segment.is_empty() {
                    continue;
                }
                let tokens = tokenizer.encode(segment);
                if tokens.len() <= opts.chunk_tokens {
                    push_piece(segment, tokens.len(), &mut pieces);
                } else if opts.split_by_character_only {
                    return Err(RagError::ChunkTokenLimit {
                        tokens: tokens.len(),
                        limit: opts.chunk_tokens,
                    });
                } else {
                    append_token_windows(tokenizer, &tokens, opts, &mut pieces);
                }
            }
        }
    }

    Ok(pieces)
}

/// Emite ventanas `[i, i+chunk_tokens)` con paso `chunk - overlap`,
/// deteniéndose cuando el final de la ventana alcanza la longitud total.
fn append_token_windows(
    tokenizer: &dyn Tokenizer,
    tokens: &[u32],
    opts: &ChunkOptions,
    pieces: &mut Vec<ChunkPiece>,
) {
    if tokens.is_empty() {
        return;
    }
    let stride = opts.chunk_tokens - opts.overlap_tokens;
    let mut start = 0usize;
    loop {
        let end = usize::min(start + opts.chunk_tokens, tokens.len());
        let window = &tokens[start..end];
        let text = tokenizer.decode(window);
        push_piece(text.trim(), window.len(), pieces);
        if end >= tokens.len() {
            break;
        }
        start += stride;
    }
}

fn push_piece(content: &str, tokens: usize, pieces: &mut Vec<ChunkPiece>) {
    if content.is_empty() {
        return;
    }
    let chunk_order_index = pieces.len();
    pieces.push(ChunkPiece {
        tokens,
        content: content.to_string(),
        chunk_order_index,
    });
}

/// Variante para el troceado interno del reranker: si el solape pedido no
/// cabe en el presupuesto por documento, lo recorta a `max_tokens - 1` y
/// deja constancia en el log. Nunca reduce el presupuesto en silencio.
pub fn clamp_rerank_overlap(max_tokens: usize, overlap_tokens: usize) -> usize {
    if overlap_tokens >= max_tokens {
        let clamped = max_tokens.saturating_sub(1);
        warn!(
            "Solape de rerank {} no cabe en max_tokens {}; recortado a {}",
            overlap_tokens, max_tokens, clamped
        );
        clamped
    } else {
        overlap_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::CharTokenizer;

    fn opts(chunk: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            chunk_tokens: chunk,
            overlap_tokens: overlap,
            ..ChunkOptions::default()
        }
    }

    #[test]
    fn windows_share_exactly_the_overlap() {
        let tok = CharTokenizer;
        let text = "abcdefghijklmnopqrstuvwxyz";
        let pieces = chunk_text(&tok, text, &opts(10, 3)).unwrap();
        // Paso de 7: ventanas [0,10), [7,17), [14,24), [21,26).
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0].content, "abcdefghij");
        assert_eq!(pieces[1].content, "hijklmnopq");
        assert_eq!(pieces[0].content[7..], pieces[1].content[..3]);
        assert_eq!(pieces[3].content, "vwxyz");
        for (i, p) in pieces.iter().enumerate() {
            assert_eq!(p.chunk_order_index, i);
        }
    }

    #[test]
    fn prefix_reconstruction_round_trips() {
        // P4: concatenar los primeros `chunk - overlap` tokens de cada
        // pieza consecutiva reproduce un prefijo del stream original.
        let tok = CharTokenizer;
        let text = "0123456789abcdefghij0123456789";
        let o = opts(8, 2);
        let pieces = chunk_text(&tok, text, &o).unwrap();
        let mut rebuilt = String::new();
        for p in &pieces[..pieces.len() - 1] {
            rebuilt.push_str(&p.content[..(o.chunk_tokens - o.overlap_tokens)]);
        }
        rebuilt.push_str(&pieces[pieces.len() - 1].content);
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn separator_mode_emits_short_segments_verbatim() {
        let tok = CharTokenizer;
        let text = "uno\n\ndos\n\n";
        let pieces = chunk_text(
            &tok,
            text,
            &ChunkOptions {
                chunk_tokens: 10,
                overlap_tokens: 2,
                split_by_character: Some("\n\n".to_string()),
                split_by_character_only: true,
            },
        )
        .unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].content, "uno");
        assert_eq!(pieces[1].content, "dos");
    }

    #[test]
    fn separator_only_mode_rejects_oversize_segments() {
        let tok = CharTokenizer;
        let err = chunk_text(
            &tok,
            "segmento demasiado largo",
            &ChunkOptions {
                chunk_tokens: 5,
                overlap_tokens: 1,
                split_by_character: Some("\n\n".to_string()),
                split_by_character_only: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, RagError::ChunkTokenLimit { limit: 5, .. }));
    }

    #[test]
    fn separator_mode_falls_back_to_windows() {
        let tok = CharTokenizer;
        let pieces = chunk_text(
            &tok,
            "corto\n\n0123456789012",
            &ChunkOptions {
                chunk_tokens: 6,
                overlap_tokens: 2,
                split_by_character: Some("\n\n".to_string()),
                split_by_character_only: false,
            },
        )
        .unwrap();
        assert!(pieces.len() > 2);
        assert_eq!(pieces[0].content, "corto");
        // Índices secuenciales a través de ambos segmentos.
        let indices: Vec<_> = pieces.iter().map(|p| p.chunk_order_index).collect();
        assert_eq!(indices, (0..pieces.len()).collect::<Vec<_>>());
    }

    #[test]
    fn overlap_equal_to_chunk_size_is_rejected() {
        let tok = CharTokenizer;
        assert!(matches!(
            chunk_text(&tok, "x", &opts(4, 4)),
            Err(RagError::Configuration { .. })
        ));
    }

    #[test]
    fn rerank_overlap_is_clamped() {
        assert_eq!(clamp_rerank_overlap(10, 4), 4);
        assert_eq!(clamp_rerank_overlap(4, 10), 3);
    }
}
