//! Abstracción del tokenizador usada por el chunker y por los
//! presupuestos de tokens del ensamblado de contexto.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::error::{RagError, Result};

/// Codifica y decodifica texto a tokens. Las implementaciones deben ser
/// deterministas: `decode(encode(t))` reproduce `t` para texto sin
/// caracteres especiales.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;

    /// Número de tokens de un texto.
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Tokenizador BPE `cl100k_base` (el de los modelos de OpenAI).
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| RagError::Configuration {
            param: "tokenizer",
            value: e.to_string(),
        })?;
        Ok(TiktokenTokenizer { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    fn decode(&self, tokens: &[u32]) -> String {
        match self.bpe.decode(tokens.to_vec()) {
            Ok(text) => text,
            Err(e) => {
                warn!("No se pudo decodificar una ventana de tokens: {e}");
                String::new()
            }
        }
    }
}

/// Tokenizador de caracteres: cada carácter es un token (su punto de
/// código). Determinista y sin dependencias de modelo; pensado para
/// pruebas y entornos sin BPE.
#[derive(Debug, Default, Clone)]
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars().map(|c| c as u32).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .filter_map(|&t| char::from_u32(t))
            .collect()
    }
}

/// Tokenizador compartido entre los componentes del motor.
pub type SharedTokenizer = Arc<dyn Tokenizer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_tokenizer_round_trips() {
        let tok = CharTokenizer;
        let text = "el grafo conecta entidades";
        let encoded = tok.encode(text);
        assert_eq!(encoded.len(), text.chars().count());
        assert_eq!(tok.decode(&encoded), text);
        assert_eq!(tok.count(text), text.chars().count());
    }
}
