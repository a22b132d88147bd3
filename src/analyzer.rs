//! Text analysis: normalization, tokenization, stop words, stemming.
//!
//! The pipeline order is fixed: HTML strip → contraction expansion → smart
//! punctuation to ASCII → whitespace collapse → Unicode lowercase → character
//! filter → split → numeric/length filters → stop words → stem. Indexing and
//! query processing run the same pipeline so stored and queried tokens agree.

use crate::config::AnalyzerConfig;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static HTML_ENTITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"&[a-zA-Z#0-9]+;").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Contraction suffixes expanded before tokenization. Applied longest-first.
/// The possessive/`is` `'s` is left alone (too ambiguous to expand).
static CONTRACTIONS: &[(&str, &str)] = &[
    ("won't", "will not"),
    ("shan't", "shall not"),
    ("n't", " not"),
    ("'re", " are"),
    ("'ve", " have"),
    ("'ll", " will"),
    ("'m", " am"),
    ("'d", " would"),
];

static STOP_WORDS: Lazy<HashMap<&'static str, HashSet<&'static str>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "en",
        [
            "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has",
            "have", "he", "her", "his", "if", "in", "into", "is", "it", "its", "no", "not", "of",
            "on", "or", "our", "she", "so", "such", "that", "the", "their", "then", "there",
            "these", "they", "this", "to", "was", "we", "were", "what", "when", "where", "which",
            "who", "will", "with", "you", "your",
        ]
        .into_iter()
        .collect::<HashSet<_>>(),
    );
    map.insert(
        "fr",
        [
            "au", "aux", "avec", "ce", "ces", "dans", "de", "des", "du", "elle", "en", "et", "il",
            "je", "la", "le", "les", "mais", "ne", "nous", "ou", "par", "pas", "pour", "que",
            "qui", "sur", "un", "une", "vous",
        ]
        .into_iter()
        .collect(),
    );
    map.insert(
        "de",
        [
            "aber", "als", "auch", "auf", "bei", "das", "dem", "den", "der", "die", "ein", "eine",
            "für", "ich", "im", "in", "ist", "mit", "nicht", "oder", "sie", "sind", "und", "von",
            "was", "wie", "zu",
        ]
        .into_iter()
        .collect(),
    );
    map.insert(
        "es",
        [
            "al", "como", "con", "de", "del", "el", "en", "es", "la", "las", "lo", "los", "más",
            "no", "para", "pero", "por", "que", "se", "su", "un", "una", "y",
        ]
        .into_iter()
        .collect(),
    );
    map
});

/// A stemmer for one language. Implementations must be cheap to call per token.
pub trait Stemmer: Send + Sync {
    fn stem(&self, word: &str) -> String;
}

/// Default lightweight English suffix stripper. Not a full Porter stemmer;
/// the `Stemmer` trait is the seam for plugging a real one in.
struct EnglishStemmer;

impl Stemmer for EnglishStemmer {
    fn stem(&self, word: &str) -> String {
        let len = word.chars().count();
        if len <= 3 {
            return word.to_string();
        }

        if let Some(base) = word.strip_suffix("sses") {
            return format!("{}ss", base);
        }
        if let Some(base) = word.strip_suffix("ies") {
            return format!("{}i", base);
        }
        if word.ends_with("ss") || word.ends_with("us") {
            return word.to_string();
        }
        if let Some(base) = word.strip_suffix("ing") {
            if base.chars().count() >= 3 && base.chars().any(is_vowel) {
                return base.to_string();
            }
            return word.to_string();
        }
        if let Some(base) = word.strip_suffix("ed") {
            if base.chars().count() >= 3 && base.chars().any(is_vowel) {
                return base.to_string();
            }
            return word.to_string();
        }
        if let Some(base) = word.strip_suffix("es") {
            if base.ends_with('x') || base.ends_with("ch") || base.ends_with("sh") {
                return base.to_string();
            }
        }
        if let Some(base) = word.strip_suffix('s') {
            if !base.ends_with('s') {
                return base.to_string();
            }
        }
        word.to_string()
    }
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y')
}

/// Output of `Analyzer::analyze`.
#[derive(Debug, Clone, PartialEq)]
pub struct Analyzed {
    pub tokens: Vec<String>,
    pub original: String,
    pub language: String,
}

/// A ranked keyword from `extract_keywords`.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub word: String,
    pub frequency: usize,
    pub score: f64,
}

/// Text analyzer. One instance per engine; stemmer instances are memoized per
/// language behind a mutex (no process-wide state).
pub struct Analyzer {
    config: AnalyzerConfig,
    custom_stop_words: HashSet<String>,
    stemmers: Mutex<HashMap<String, Arc<dyn Stemmer>>>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let custom_stop_words = config
            .custom_stop_words
            .iter()
            .map(|w| w.to_lowercase())
            .collect();
        Self {
            config,
            custom_stop_words,
            stemmers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a stemmer for a language, replacing the built-in fallback.
    pub fn register_stemmer(&self, language: &str, stemmer: Arc<dyn Stemmer>) {
        self.stemmers.lock().insert(language.to_string(), stemmer);
    }

    fn stemmer_for(&self, language: &str) -> Arc<dyn Stemmer> {
        let mut stemmers = self.stemmers.lock();
        if let Some(s) = stemmers.get(language) {
            return Arc::clone(s);
        }
        // Unknown languages fall back to English
        let stemmer: Arc<dyn Stemmer> = Arc::new(EnglishStemmer);
        stemmers.insert(language.to_string(), Arc::clone(&stemmer));
        stemmer
    }

    /// Run the full pipeline on `text`.
    pub fn analyze(&self, text: &str, language: Option<&str>) -> Analyzed {
        let language = language.unwrap_or("en").to_string();
        let mut tokens = self.tokenize(text);

        if self.config.remove_numbers {
            tokens.retain(|t| !t.chars().all(|c| c.is_numeric()));
        }
        tokens.retain(|t| {
            let len = t.chars().count();
            len >= self.config.min_word_length && len <= self.config.max_word_length
        });

        tokens = self.remove_stop_words(tokens, &language);

        let stemmer = self.stemmer_for(&language);
        let tokens = tokens.iter().map(|t| stemmer.stem(t)).collect();

        Analyzed {
            tokens,
            original: text.to_string(),
            language,
        }
    }

    /// Normalize text without splitting: HTML strip, contractions, smart
    /// punctuation, whitespace collapse, lowercase, character filter.
    pub fn normalize(&self, text: &str) -> String {
        let mut text = text.to_string();

        if self.config.strip_html {
            text = HTML_TAG_RE.replace_all(&text, " ").into_owned();
            text = HTML_ENTITY_RE.replace_all(&text, " ").into_owned();
        }

        if self.config.expand_contractions {
            let lower = text.to_lowercase();
            let mut expanded = String::with_capacity(lower.len());
            for word in lower.split_whitespace() {
                // The smart-punctuation pass runs after this one, so curly
                // apostrophes count as contraction apostrophes here.
                let word = word.replace('\u{2019}', "'");
                let mut replaced = None;
                for (suffix, replacement) in CONTRACTIONS {
                    if *suffix == "won't" || *suffix == "shan't" {
                        if word == *suffix {
                            replaced = Some(replacement.to_string());
                            break;
                        }
                    } else if let Some(base) = word.strip_suffix(suffix) {
                        if !base.is_empty() {
                            replaced = Some(format!("{}{}", base, replacement));
                            break;
                        }
                    }
                }
                if !expanded.is_empty() {
                    expanded.push(' ');
                }
                expanded.push_str(&replaced.unwrap_or(word));
            }
            text = expanded;
        }

        // Smart quotes and ellipsis to ASCII
        text = text
            .replace(['\u{2018}', '\u{2019}'], "'")
            .replace(['\u{201C}', '\u{201D}'], "\"")
            .replace('\u{2026}', "...")
            .replace(['\u{2013}', '\u{2014}'], "-");

        if self.config.lowercase {
            text = text.to_lowercase();
        }

        if self.config.strip_punctuation {
            text = text
                .chars()
                .map(|c| {
                    if c.is_alphanumeric() || c.is_whitespace() || c == '\'' || c == '-' {
                        c
                    } else {
                        ' '
                    }
                })
                .collect();
        }

        WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
    }

    /// Normalize and split on whitespace. No stop-word or length filtering.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.normalize(text)
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    /// Stem a single token for a language.
    pub fn stem(&self, token: &str, language: &str) -> String {
        self.stemmer_for(language).stem(token)
    }

    /// Drop stop words (per-language base list merged with user additions).
    /// Returns tokens unchanged when stop-word removal is disabled.
    pub fn remove_stop_words(&self, tokens: Vec<String>, language: &str) -> Vec<String> {
        if self.config.disable_stop_words {
            return tokens;
        }
        let base = STOP_WORDS.get(language);
        tokens
            .into_iter()
            .filter(|t| {
                let lower = t.to_lowercase();
                !base.map_or(false, |set| set.contains(lower.as_str()))
                    && !self.custom_stop_words.contains(&lower)
            })
            .collect()
    }

    /// Top keywords by frequency, scored relative to the most frequent term.
    pub fn extract_keywords(&self, text: &str, limit: usize) -> Vec<Keyword> {
        let analyzed = self.analyze(text, None);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in analyzed.tokens {
            *counts.entry(token).or_insert(0) += 1;
        }
        let max_freq = counts.values().copied().max().unwrap_or(1) as f64;

        let mut keywords: Vec<Keyword> = counts
            .into_iter()
            .map(|(word, frequency)| Keyword {
                score: frequency as f64 / max_freq,
                word,
                frequency,
            })
            .collect();
        keywords.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.word.cmp(&b.word))
        });
        keywords.truncate(limit);
        keywords
    }
}
