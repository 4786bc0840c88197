//! Deterministic safety filter.
//!
//! A pure function over text: weighted keyword categories (with leet-speak
//! normalization and a short multi-language list) plus a few regexes.
//! Same input, same output; no network, no clock. The filter never blocks
//! anything; it only annotates for the reviewer and the priority formula.

use std::collections::HashMap;

use maren_core::SafetyAnnotation;
use regex::Regex;
use tracing::debug;

/// A category's weight contributes the annotation's risk score via max().
const CATEGORY_WEIGHTS: &[(&str, f64)] = &[
    ("prohibited", 1.0),
    ("sexual", 0.9),
    ("dating", 0.8),
    ("ambiguous", 0.6),
    ("mild", 0.3),
];

/// Built-in lexicon. Extended per category from configuration.
const BUILTIN_TERMS: &[(&str, &[&str])] = &[
    (
        "prohibited",
        &["underage", "minor", "jailbait", "menor de edad"],
    ),
    (
        "sexual",
        &["nude", "nudes", "sexting", "explicit", "desnudo", "desnuda"],
    ),
    (
        "dating",
        &[
            "meet up",
            "meet irl",
            "be my girlfriend",
            "be my boyfriend",
            "go on a date",
            "una cita",
        ],
    ),
    (
        "ambiguous",
        &["cashapp", "venmo", "paypal", "send money", "onlyfans"],
    ),
    ("mild", &["kiss", "flirt", "sexy", "hot pics"]),
];

/// Deterministic content annotator.
pub struct SafetyFilter {
    terms: Vec<(String, f64, Vec<String>)>,
    patterns: Vec<(String, f64, Regex)>,
}

impl SafetyFilter {
    /// Build the filter with built-in lexicons plus configured extras.
    #[must_use]
    pub fn new(extra_terms: &HashMap<String, Vec<String>>) -> Self {
        let mut terms = Vec::new();
        for &(category, weight) in CATEGORY_WEIGHTS {
            let mut words: Vec<String> = BUILTIN_TERMS
                .iter()
                .find(|(name, _)| *name == category)
                .map(|(_, list)| list.iter().map(|s| normalize(s)).collect())
                .unwrap_or_default();
            if let Some(extras) = extra_terms.get(category) {
                words.extend(extras.iter().map(|s| normalize(s)));
            }
            terms.push((category.to_owned(), weight, words));
        }

        // Compiled once; failures are programming errors caught by tests.
        let patterns = [
            // Long digit runs look like phone numbers.
            ("contact_info", 0.6, r"\b\d{7,}\b"),
            // Off-platform links.
            ("link", 0.3, r"https?://\S+"),
        ]
        .into_iter()
        .filter_map(|(tag, weight, pattern)| {
            Regex::new(pattern)
                .map(|regex| (tag.to_owned(), weight, regex))
                .ok()
        })
        .collect();

        Self { terms, patterns }
    }

    /// Annotate one text.
    #[must_use]
    pub fn analyze(&self, text: &str) -> SafetyAnnotation {
        let normalized = normalize(text);
        let mut risk: f64 = 0.0;
        let mut flags = Vec::new();

        for (category, weight, words) in &self.terms {
            if words.iter().any(|w| normalized.contains(w.as_str())) {
                risk = risk.max(*weight);
                flags.push(category.clone());
            }
        }
        for (tag, weight, regex) in &self.patterns {
            if regex.is_match(text) {
                risk = risk.max(*weight);
                flags.push(tag.clone());
            }
        }

        if !flags.is_empty() {
            debug!(risk, ?flags, "safety hit");
        }
        SafetyAnnotation {
            risk_score: risk,
            flags,
        }
    }

    /// Annotate a bubble sequence: each bubble plus the concatenation,
    /// taking the maximum risk and the union of flags.
    #[must_use]
    pub fn analyze_bubbles(&self, bubbles: &[String]) -> SafetyAnnotation {
        let mut combined = self.analyze(&bubbles.join(" "));
        for bubble in bubbles {
            let single = self.analyze(bubble);
            combined.risk_score = combined.risk_score.max(single.risk_score);
            for flag in single.flags {
                if !combined.flags.contains(&flag) {
                    combined.flags.push(flag);
                }
            }
        }
        combined
    }
}

/// Lowercase and undo common leet substitutions.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            '0' => 'o',
            '1' | '!' => 'i',
            '3' => 'e',
            '4' | '@' => 'a',
            '5' | '$' => 's',
            '7' => 't',
            other => other,
        })
        .collect()
}

impl std::fmt::Debug for SafetyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyFilter")
            .field("categories", &self.terms.len())
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> SafetyFilter {
        SafetyFilter::new(&HashMap::new())
    }

    #[test]
    fn test_clean_text_scores_zero() {
        let annotation = filter().analyze("hey what are you up to?");
        assert!(annotation.risk_score.abs() < f64::EPSILON);
        assert!(annotation.flags.is_empty());
    }

    #[test]
    fn test_weights_take_max() {
        let annotation = filter().analyze("send nudes and let's meet up");
        assert!((annotation.risk_score - 0.9).abs() < f64::EPSILON);
        assert!(annotation.flags.contains(&"sexual".to_string()));
        assert!(annotation.flags.contains(&"dating".to_string()));
    }

    #[test]
    fn test_leet_normalization() {
        let annotation = filter().analyze("s3nd nud3s");
        assert!(annotation.flags.contains(&"sexual".to_string()));
    }

    #[test]
    fn test_phone_number_pattern() {
        let annotation = filter().analyze("text me at 5551234567");
        assert!(annotation.flags.contains(&"contact_info".to_string()));
        assert!((annotation.risk_score - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deterministic() {
        let f = filter();
        let a = f.analyze("n0 w4y, meet up?");
        let b = f.analyze("n0 w4y, meet up?");
        assert_eq!(a, b);
    }

    #[test]
    fn test_extra_terms_merge() {
        let extras = HashMap::from([("prohibited".to_owned(), vec!["forbiddenword".to_owned()])]);
        let f = SafetyFilter::new(&extras);
        let annotation = f.analyze("this contains forbiddenword here");
        assert!((annotation.risk_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bubble_union() {
        let f = filter();
        let annotation = f.analyze_bubbles(&[
            "wanna flirt?".to_string(),
            "here is my venmo".to_string(),
        ]);
        assert!(annotation.flags.contains(&"mild".to_string()));
        assert!(annotation.flags.contains(&"ambiguous".to_string()));
        assert!((annotation.risk_score - 0.6).abs() < f64::EPSILON);
    }
}
