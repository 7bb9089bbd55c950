//! # Text-similarity scorer
//!
//! Fuzzy lexical matching used by the hybrid ranker when `text_weight > 0`.
//! Given a query string and a candidate's content, the score is the maximum
//! of four signals:
//!
//! 1. whole-string fuzzy similarity (`1 − lev/max(|Q|,|C|)`),
//! 2. word-level coverage — the fraction of query tokens whose best fuzzy
//!    match against any content token reaches 0.8,
//! 3. the same two signals over *phonetically canonicalized* text, which
//!    lets Latin queries hit romanizable non-Latin content and vice versa,
//! 4. configured translation pairs — tokens the caller declared equivalent
//!    score as equal.
//!
//! A multiplicative boost table then applies per-term factors whenever a
//! boost term appears on both sides. Scores are clamped to [0, 1] unless
//! `allow_score_above_one` is set.
//!
//! Canonicalization romanizes Cyrillic and Greek through a static
//! transliteration table, strips combining marks (so pinyin-style tone
//! accents vanish), lowercases, and drops separators. Runes with no
//! romanization pass through unchanged.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use strsim::normalized_levenshtein;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::config::TextSimilarityConfig;

/// A query token fuzzy-matches a content token at or above this ratio.
const WORD_MATCH_THRESHOLD: f64 = 0.8;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").unwrap());

/// Romanization table for Cyrillic and Greek. Lowercase keys; uppercase
/// input is lowercased before lookup.
static ROMAN_TABLE: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    let pairs: &[(char, &str)] = &[
        // Cyrillic
        ('а', "a"), ('б', "b"), ('в', "v"), ('г', "g"), ('д', "d"),
        ('е', "e"), ('ё', "e"), ('ж', "zh"), ('з', "z"), ('и', "i"),
        ('й', "i"), ('к', "k"), ('л', "l"), ('м', "m"), ('н', "n"),
        ('о', "o"), ('п', "p"), ('р', "r"), ('с', "s"), ('т', "t"),
        ('у', "u"), ('ф', "f"), ('х', "kh"), ('ц', "ts"), ('ч', "ch"),
        ('ш', "sh"), ('щ', "shch"), ('ъ', ""), ('ы', "y"), ('ь', ""),
        ('э', "e"), ('ю', "yu"), ('я', "ya"),
        // Greek
        ('α', "a"), ('β', "v"), ('γ', "g"), ('δ', "d"), ('ε', "e"),
        ('ζ', "z"), ('η', "i"), ('θ', "th"), ('ι', "i"), ('κ', "k"),
        ('λ', "l"), ('μ', "m"), ('ν', "n"), ('ξ', "x"), ('ο', "o"),
        ('π', "p"), ('ρ', "r"), ('σ', "s"), ('ς', "s"), ('τ', "t"),
        ('υ', "y"), ('φ', "f"), ('χ', "ch"), ('ψ', "ps"), ('ω', "o"),
    ];
    pairs.iter().copied().collect()
});

/// Canonicalize text into a phonetic form: NFD, strip combining marks (no
/// tones), romanize through the table, lowercase, no separators.
/// Non-convertible runes pass through unchanged.
pub fn phonetic_canonicalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        if c.is_whitespace() || c.is_ascii_punctuation() {
            out.push(' ');
            continue;
        }
        let lower = c.to_lowercase().next().unwrap_or(c);
        match ROMAN_TABLE.get(&lower) {
            Some(s) => out.push_str(s),
            None => out.push(lower),
        }
    }
    out
}

fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Configured fuzzy/phonetic scorer. Built once per store from
/// [`TextSimilarityConfig`].
pub struct TextMatcher {
    boost_terms: HashMap<String, f32>,
    pairs: HashMap<String, HashSet<String>>,
    allow_above_one: bool,
}

impl TextMatcher {
    pub fn new(config: &TextSimilarityConfig) -> Self {
        let mut pairs: HashMap<String, HashSet<String>> = HashMap::new();
        for (a, b) in &config.term_pairs {
            let a = a.to_lowercase();
            let b = b.to_lowercase();
            pairs.entry(a.clone()).or_default().insert(b.clone());
            pairs.entry(b).or_default().insert(a);
        }
        Self {
            boost_terms: config
                .boost_terms
                .iter()
                .map(|(k, v)| (k.to_lowercase(), *v))
                .collect(),
            pairs,
            allow_above_one: config.allow_score_above_one,
        }
    }

    /// Score `content` against `query`, in [0, 1] unless configured
    /// otherwise.
    pub fn score(&self, query: &str, content: &str) -> f32 {
        if query.is_empty() || content.is_empty() {
            return 0.0;
        }

        let q_tokens = tokenize(query);
        let c_tokens = tokenize(content);

        let fuzzy = normalized_levenshtein(&query.to_lowercase(), &content.to_lowercase()) as f32;
        let coverage = self.coverage(&q_tokens, &c_tokens);

        let q_phon = phonetic_canonicalize(query);
        let c_phon = phonetic_canonicalize(content);
        let phon_fuzzy = normalized_levenshtein(&q_phon, &c_phon) as f32;
        let phon_coverage = self.coverage(&tokenize(&q_phon), &tokenize(&c_phon));

        let mut score = fuzzy.max(coverage).max(phon_fuzzy).max(phon_coverage);
        score = self.apply_boosts(score, &q_tokens, &c_tokens);

        if self.allow_above_one {
            score.max(0.0)
        } else {
            score.clamp(0.0, 1.0)
        }
    }

    /// Fraction of query tokens with a good-enough match among the content
    /// tokens. Translation pairs count as exact matches.
    fn coverage(&self, q_tokens: &[String], c_tokens: &[String]) -> f32 {
        if q_tokens.is_empty() || c_tokens.is_empty() {
            return 0.0;
        }
        let matched = q_tokens
            .iter()
            .filter(|q| {
                c_tokens.iter().any(|c| {
                    self.tokens_paired(q, c)
                        || normalized_levenshtein(q, c) >= WORD_MATCH_THRESHOLD
                })
            })
            .count();
        matched as f32 / q_tokens.len() as f32
    }

    fn tokens_paired(&self, a: &str, b: &str) -> bool {
        a == b
            || self
                .pairs
                .get(a)
                .map(|set| set.contains(b))
                .unwrap_or(false)
    }

    fn apply_boosts(&self, mut score: f32, q_tokens: &[String], c_tokens: &[String]) -> f32 {
        if self.boost_terms.is_empty() {
            return score;
        }
        let c_set: HashSet<&str> = c_tokens.iter().map(String::as_str).collect();
        for q in q_tokens {
            if let Some(factor) = self.boost_terms.get(q) {
                if c_set.contains(q.as_str()) {
                    score *= factor;
                }
            }
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(config: TextSimilarityConfig) -> TextMatcher {
        TextMatcher::new(&config)
    }

    fn default_matcher() -> TextMatcher {
        matcher(TextSimilarityConfig::default())
    }

    #[test]
    fn test_identical_strings_score_one() {
        let m = default_matcher();
        assert!((m.score("hello world", "hello world") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_sides_score_zero() {
        let m = default_matcher();
        assert_eq!(m.score("", "anything"), 0.0);
        assert_eq!(m.score("anything", ""), 0.0);
    }

    #[test]
    fn test_word_coverage_beats_whole_string_fuzz() {
        let m = default_matcher();
        // Every query token appears in the long content, so coverage is 1
        // even though whole-string Levenshtein is poor.
        let score = m.score("apple banana", "a list: banana, cherry, apple, durian, elderberry");
        assert!(score > 0.9, "score {score}");
    }

    #[test]
    fn test_typo_tolerated_at_word_level() {
        let m = default_matcher();
        let score = m.score("bananna", "banana split");
        assert!(score >= 0.8, "score {score}");
    }

    #[test]
    fn test_phonetic_match_across_scripts() {
        let m = default_matcher();
        // "Москва" romanizes to "moskva".
        let score = m.score("moskva", "Москва");
        assert!(score > 0.9, "score {score}");
    }

    #[test]
    fn test_tones_are_stripped() {
        assert_eq!(phonetic_canonicalize("nǐ hǎo"), "ni hao");
    }

    #[test]
    fn test_nonconvertible_runes_pass_through() {
        let canon = phonetic_canonicalize("中文 abc");
        assert!(canon.contains('中'));
        assert!(canon.contains("abc"));
    }

    #[test]
    fn test_term_pairs_score_as_equal() {
        let config = TextSimilarityConfig {
            term_pairs: vec![("hello".into(), "bonjour".into())],
            ..TextSimilarityConfig::default()
        };
        let m = matcher(config);
        let score = m.score("hello", "bonjour");
        assert!((score - 1.0).abs() < 1e-6, "score {score}");
        // And the reverse direction.
        let score = m.score("bonjour", "hello there");
        assert!(score >= 1.0 - 1e-6, "score {score}");
    }

    #[test]
    fn test_boost_applies_when_term_on_both_sides() {
        let mut boost_terms = HashMap::new();
        boost_terms.insert("urgent".to_string(), 1.5f32);
        let config = TextSimilarityConfig {
            boost_terms: boost_terms.clone(),
            allow_score_above_one: false,
            ..TextSimilarityConfig::default()
        };
        let clamped = matcher(config).score("urgent report", "urgent quarterly report");
        assert!(clamped <= 1.0);

        let config = TextSimilarityConfig {
            boost_terms,
            allow_score_above_one: true,
            ..TextSimilarityConfig::default()
        };
        let unbounded = matcher(config).score("urgent report", "urgent quarterly report");
        assert!(unbounded > 1.0, "score {unbounded}");
    }

    #[test]
    fn test_boost_skipped_when_term_missing_from_content() {
        let mut boost_terms = HashMap::new();
        boost_terms.insert("urgent".to_string(), 2.0f32);
        let config = TextSimilarityConfig {
            boost_terms,
            allow_score_above_one: true,
            ..TextSimilarityConfig::default()
        };
        let m = matcher(config);
        assert!(m.score("urgent news", "quarterly report") <= 1.0);
    }
}
