//! Typo-tolerant term expansion.
//!
//! Four strategies behind one `expand` seam: basic (structural variants, no
//! vocabulary), Jaro-Winkler, trigram Jaccard, and Levenshtein with
//! prefilters. Variants carry a similarity in [0,1], ordered descending.
//!
//! The matcher keeps two caches: the vocabulary (term, frequency) list with a
//! TTL, and an LRU of computed variants persisted to a sidecar JSON file next
//! to the database. Both are invalidated when the index generation counter
//! moves, which happens on every write batch.

use crate::config::{FuzzyAlgorithm, SearchConfig};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Number of entries dropped in one eviction pass when the variant cache
/// exceeds its capacity.
const EVICTION_BATCH: usize = 100;

/// Entries written since the last sidecar persist that trigger another one.
const PERSIST_EVERY: usize = 16;

/// A candidate expansion of a query term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub term: String,
    /// Similarity to the source term, in [0,1].
    pub score: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SidecarCache {
    generation: u64,
    entries: Vec<(String, Vec<Variant>)>,
}

struct CachedVocabulary {
    terms: Vec<(String, u64)>,
    fetched_at: Instant,
    generation: u64,
}

struct VariantCacheState {
    cache: LruCache<String, Vec<Variant>>,
    generation: u64,
    dirty: usize,
}

/// Fuzzy matcher for one index.
pub struct FuzzyMatcher {
    algorithm: FuzzyAlgorithm,
    jaro_winkler_threshold: f64,
    trigram_threshold: f64,
    trigram_size: usize,
    levenshtein_threshold: usize,
    min_term_frequency: u64,
    max_variations: usize,
    cache_capacity: usize,
    vocab_ttl: Duration,
    sidecar_path: Option<PathBuf>,
    vocabulary: Mutex<Option<CachedVocabulary>>,
    variants: Mutex<VariantCacheState>,
}

impl FuzzyMatcher {
    /// `sidecar_dir` is the database directory; `None` (in-memory databases)
    /// disables sidecar persistence.
    pub fn new(config: &SearchConfig, index: &str, sidecar_dir: Option<&Path>) -> Self {
        let sidecar_path = sidecar_dir.map(|d| d.join(format!("{}_fuzzy_cache.json", index)));
        let matcher = Self {
            algorithm: config.fuzzy_algorithm,
            jaro_winkler_threshold: config.jaro_winkler_threshold,
            trigram_threshold: config.trigram_threshold,
            trigram_size: config.trigram_size,
            levenshtein_threshold: config.levenshtein_threshold,
            min_term_frequency: config.min_term_frequency,
            max_variations: config.max_fuzzy_variations,
            cache_capacity: config.fuzzy_cache_max_entries,
            vocab_ttl: Duration::from_secs(config.indexed_terms_cache_ttl),
            sidecar_path,
            vocabulary: Mutex::new(None),
            variants: Mutex::new(VariantCacheState {
                cache: LruCache::unbounded(),
                generation: 0,
                dirty: 0,
            }),
        };
        matcher.load_sidecar();
        matcher
    }

    pub fn algorithm(&self) -> FuzzyAlgorithm {
        self.algorithm
    }

    /// Whether this algorithm needs a vocabulary at all.
    pub fn needs_vocabulary(&self) -> bool {
        self.algorithm != FuzzyAlgorithm::Basic
    }

    /// Expand `term` against the current vocabulary, consulting and filling
    /// the caches. `fetch_vocab` is called at most once, when the in-memory
    /// vocabulary is stale or the generation moved.
    pub fn expand_cached<F>(
        &self,
        term: &str,
        threshold_override: Option<f64>,
        generation: u64,
        fetch_vocab: F,
    ) -> Vec<Variant>
    where
        F: FnOnce() -> Vec<(String, u64)>,
    {
        // Overridden thresholds bypass the cache; they are rare (per-query
        // fuzziness) and would otherwise poison entries computed with the
        // configured threshold.
        if threshold_override.is_none() {
            let mut state = self.variants.lock();
            if state.generation != generation {
                state.cache.clear();
                state.generation = generation;
            } else if let Some(hit) = state.cache.get(term) {
                return hit.clone();
            }
        }

        let vocab = if self.needs_vocabulary() {
            self.vocabulary_for(generation, fetch_vocab)
        } else {
            Vec::new()
        };
        let result = self.expand_with_threshold(term, &vocab, threshold_override);

        if threshold_override.is_none() {
            let mut state = self.variants.lock();
            if state.generation == generation {
                state.cache.put(term.to_string(), result.clone());
                if state.cache.len() > self.cache_capacity {
                    for _ in 0..EVICTION_BATCH {
                        if state.cache.pop_lru().is_none() {
                            break;
                        }
                    }
                }
                state.dirty += 1;
                if state.dirty >= PERSIST_EVERY {
                    state.dirty = 0;
                    let snapshot = Self::snapshot(&state);
                    drop(state);
                    self.write_sidecar(&snapshot);
                }
            }
        }

        result
    }

    fn vocabulary_for<F>(&self, generation: u64, fetch: F) -> Vec<(String, u64)>
    where
        F: FnOnce() -> Vec<(String, u64)>,
    {
        let mut vocab = self.vocabulary.lock();
        if let Some(cached) = vocab.as_ref() {
            if cached.generation == generation && cached.fetched_at.elapsed() < self.vocab_ttl {
                return cached.terms.clone();
            }
        }
        let terms = fetch();
        *vocab = Some(CachedVocabulary {
            terms: terms.clone(),
            fetched_at: Instant::now(),
            generation,
        });
        terms
    }

    /// Pure expansion against an explicit vocabulary.
    pub fn expand(&self, term: &str, vocab: &[(String, u64)]) -> Vec<Variant> {
        self.expand_with_threshold(term, vocab, None)
    }

    fn expand_with_threshold(
        &self,
        term: &str,
        vocab: &[(String, u64)],
        threshold_override: Option<f64>,
    ) -> Vec<Variant> {
        let mut variants = match self.algorithm {
            FuzzyAlgorithm::Basic => basic_variants(term),
            FuzzyAlgorithm::JaroWinkler => {
                let threshold = threshold_override.unwrap_or(self.jaro_winkler_threshold);
                jaro_winkler_variants(term, vocab, threshold)
            }
            FuzzyAlgorithm::Trigram => {
                let threshold = threshold_override.unwrap_or(self.trigram_threshold);
                trigram_variants(term, vocab, self.trigram_size, threshold)
            }
            FuzzyAlgorithm::Levenshtein => levenshtein_variants(
                term,
                vocab,
                self.levenshtein_threshold,
                self.min_term_frequency,
            ),
        };
        variants.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.term.cmp(&b.term)));
        variants.truncate(self.max_variations);
        variants
    }

    /// Flush the variant cache to its sidecar file.
    pub fn persist(&self) {
        let state = self.variants.lock();
        let snapshot = Self::snapshot(&state);
        drop(state);
        self.write_sidecar(&snapshot);
    }

    fn snapshot(state: &VariantCacheState) -> SidecarCache {
        SidecarCache {
            generation: state.generation,
            entries: state
                .cache
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn write_sidecar(&self, snapshot: &SidecarCache) {
        let Some(path) = &self.sidecar_path else { return };
        match serde_json::to_vec(snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    tracing::debug!(path = %path.display(), error = %e, "fuzzy cache write failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "fuzzy cache serialize failed"),
        }
    }

    /// Best-effort sidecar load; any failure degrades to a cold cache.
    fn load_sidecar(&self) {
        let Some(path) = &self.sidecar_path else { return };
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => return,
        };
        let sidecar: SidecarCache = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "fuzzy cache unreadable, recomputing");
                return;
            }
        };
        let mut state = self.variants.lock();
        state.generation = sidecar.generation;
        // Entries were snapshotted most-recent-first; insert in reverse so
        // LRU order survives the roundtrip.
        for (term, variants) in sidecar.entries.into_iter().rev() {
            state.cache.put(term, variants);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Algorithms
// ─────────────────────────────────────────────────────────────────────────────

/// Structural variants of a term: a trailing prefix wildcard, single-character
/// deletions, and adjacent transpositions. Only mid-size terms qualify; FTS5
/// cannot serve mid-word wildcards, so none are produced.
fn basic_variants(term: &str) -> Vec<Variant> {
    let chars: Vec<char> = term.chars().collect();
    let len = chars.len();
    if len <= 3 {
        return Vec::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut variants = Vec::new();
    let mut push = |seen: &mut HashSet<String>, variants: &mut Vec<Variant>, t: String, score: f64| {
        if t != term && seen.insert(t.clone()) {
            variants.push(Variant { term: t, score });
        }
    };

    let reduced_score = (len - 1) as f64 / len as f64;

    push(&mut seen, &mut variants, format!("{}*", term), 0.9);
    let stem: String = chars[..len - 1].iter().collect();
    push(&mut seen, &mut variants, format!("{}*", stem), 0.85);

    for i in 0..len {
        let mut deleted: String = chars[..i].iter().collect();
        deleted.extend(&chars[i + 1..]);
        push(&mut seen, &mut variants, deleted, reduced_score);
    }

    for i in 0..len - 1 {
        let mut swapped = chars.clone();
        swapped.swap(i, i + 1);
        push(&mut seen, &mut variants, swapped.into_iter().collect(), reduced_score);
    }

    variants
}

fn jaro_winkler_variants(term: &str, vocab: &[(String, u64)], threshold: f64) -> Vec<Variant> {
    vocab
        .iter()
        .filter(|(candidate, _)| candidate != term)
        .filter_map(|(candidate, _)| {
            let score = strsim::jaro_winkler(term, candidate);
            (score >= threshold).then(|| Variant { term: candidate.clone(), score })
        })
        .collect()
}

/// Contiguous n-grams of a term. Terms of 4 characters or fewer use bigrams
/// regardless of the configured size (adaptive n-gram); terms shorter than
/// the effective n yield the term itself.
fn ngrams(term: &str, size: usize) -> HashSet<String> {
    let chars: Vec<char> = term.chars().collect();
    let n = if chars.len() <= 4 { 2.min(size) } else { size };
    if chars.len() < n || n == 0 {
        let mut set = HashSet::new();
        set.insert(term.to_string());
        return set;
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn trigram_variants(
    term: &str,
    vocab: &[(String, u64)],
    size: usize,
    threshold: f64,
) -> Vec<Variant> {
    let term_grams = ngrams(term, size);
    vocab
        .iter()
        .filter(|(candidate, _)| candidate != term)
        .filter_map(|(candidate, _)| {
            let score = jaccard(&term_grams, &ngrams(candidate, size));
            (score >= threshold).then(|| Variant { term: candidate.clone(), score })
        })
        .collect()
}

/// Bigram multiset size shared between two terms, used as a Levenshtein
/// prefilter: candidates sharing fewer than ⌈len/2⌉ bigrams cannot be close.
fn shared_bigrams(a: &str, b: &str) -> usize {
    let a_grams = ngrams_list(a);
    let mut b_grams = ngrams_list(b);
    let mut shared = 0;
    for gram in a_grams {
        if let Some(pos) = b_grams.iter().position(|g| *g == gram) {
            b_grams.swap_remove(pos);
            shared += 1;
        }
    }
    shared
}

fn ngrams_list(term: &str) -> Vec<String> {
    let chars: Vec<char> = term.chars().collect();
    if chars.len() < 2 {
        return vec![term.to_string()];
    }
    chars.windows(2).map(|w| w.iter().collect()).collect()
}

fn levenshtein_variants(
    term: &str,
    vocab: &[(String, u64)],
    max_distance: usize,
    min_frequency: u64,
) -> Vec<Variant> {
    let term_chars: Vec<char> = term.chars().collect();
    let term_len = term_chars.len();
    let required_bigrams = term_len.div_ceil(2);

    vocab
        .iter()
        .filter(|(_, freq)| *freq >= min_frequency)
        .filter(|(candidate, _)| candidate != term)
        .filter(|(candidate, _)| {
            let clen = candidate.chars().count();
            clen.abs_diff(term_len) <= max_distance
        })
        .filter(|(candidate, _)| {
            // First/last character must agree when the term is long enough
            // for that to be a meaningful signal.
            if term_len < 4 {
                return true;
            }
            let mut cchars = candidate.chars();
            let first = cchars.next();
            let last = candidate.chars().next_back();
            first == term_chars.first().copied() || last == term_chars.last().copied()
        })
        .filter(|(candidate, _)| shared_bigrams(term, candidate) >= required_bigrams)
        .filter_map(|(candidate, _)| {
            let distance = strsim::levenshtein(term, candidate);
            if distance > max_distance {
                return None;
            }
            let max_len = term_len.max(candidate.chars().count()).max(1);
            Some(Variant {
                term: candidate.clone(),
                score: 1.0 - distance as f64 / max_len as f64,
            })
        })
        .collect()
}
