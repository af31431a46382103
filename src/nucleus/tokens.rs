//! Prompt token estimation.
//!
//! A character-per-token heuristic, tuned down for code-heavy text (code
//! tokenizes denser than prose). Used only for budget enforcement: the
//! transport's reported usage is authoritative when available, but budget
//! decisions must be made *before* a request is sent.

/// Average characters per token for prose.
const PROSE_CHARS_PER_TOKEN: f64 = 4.0;

/// Average characters per token for code-like text.
const CODE_CHARS_PER_TOKEN: f64 = 3.0;

/// Symbol density above which text is treated as code.
const CODE_SYMBOL_DENSITY: f64 = 0.04;

/// Estimate the token count of `text`.
pub fn estimate(text: &str) -> u64 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    let ratio = if looks_like_code(text) {
        CODE_CHARS_PER_TOKEN
    } else {
        PROSE_CHARS_PER_TOKEN
    };
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        ((chars as f64) / ratio).ceil() as u64
    }
}

/// Crude code detector: density of structural symbols.
fn looks_like_code(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let symbols = text
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '(' | ')' | ';' | '=' | '<' | '>' | '[' | ']'))
        .count();
    #[allow(clippy::cast_precision_loss)]
    {
        (symbols as f64) / (total as f64) > CODE_SYMBOL_DENSITY
    }
}
