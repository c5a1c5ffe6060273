//! Fulltext tokenization.
//!
//! Lowercased Unicode word split: alphanumeric runs become tokens, every
//! other character separates. Query text and indexed text pass through the
//! same tokenizer, giving AND semantics over exact tokens.

/// Configuration for the fulltext tokenizer.
#[derive(Debug, Clone)]
pub struct TokenizerConfig {
    /// Minimum token length to index.
    pub min_token_length: usize,
    /// Maximum token length to index.
    pub max_token_length: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            min_token_length: 1,
            max_token_length: 128,
        }
    }
}

/// Splits text into normalized tokens.
///
/// Duplicates are preserved; callers deduplicate when building postings.
#[must_use]
pub fn tokenize(config: &TokenizerConfig, text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                current.push(lower);
            }
        } else if !current.is_empty() {
            push_token(config, &mut tokens, std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        push_token(config, &mut tokens, current);
    }
    tokens
}

fn push_token(config: &TokenizerConfig, tokens: &mut Vec<String>, token: String) {
    let len = token.chars().count();
    if len >= config.min_token_length && len <= config.max_token_length {
        tokens.push(token);
    }
}

/// Tokenizes and deduplicates, preserving first-seen order.
#[must_use]
pub fn unique_tokens(config: &TokenizerConfig, text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(config, text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
