//! Normalización del texto extraído y troceado en chunks solapados.

use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("regex válida"));
static BLANK_LINE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("regex válida"));

/// Parámetros del troceado, en caracteres.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 200,
        }
    }
}

/// Colapsa cada racha de espacios (saltos de línea incluidos) en un único
/// espacio, reduce rachas de 3+ saltos a dos y recorta los extremos.
///
/// Tras el primer paso ya no quedan saltos de línea, así que la salida es
/// una sola línea. Es idempotente.
pub fn normalize_text(text: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(text, " ");
    let paragraphs = BLANK_LINE_RUN.replace_all(&collapsed, "\n\n");
    paragraphs.trim().to_string()
}

/// Trocea `text` en ventanas de como mucho `size` caracteres que se solapan
/// `overlap` caracteres.
///
/// Si la ventana no es la última y contiene un `.` o `\n` más allá de la
/// mitad de `size`, se corta justo detrás de él. El cursor siempre avanza al
/// menos un carácter, también cuando `overlap >= size`, y se detiene tras la
/// ventana que llega al final del texto.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < len {
        let end = (start + config.size).min(len);
        let mut window = &chars[start..end];

        if end < len {
            let boundary = window.iter().rposition(|c| *c == '.' || *c == '\n');
            if let Some(pos) = boundary {
                if pos * 2 > config.size {
                    window = &window[..=pos];
                }
            }
        }

        let chunk: String = window.iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        if end == len {
            break;
        }

        start += window.len().saturating_sub(config.overlap).max(1);
    }

    chunks
}
