//! Deterministic history digests.
//!
//! No model calls: the digest is a pure function of the compressed entries,
//! so the same history always produces the same bytes; a requirement for
//! prompt-cache stability.

use std::collections::HashMap;

/// Words shorter than this never count as topics.
const MIN_TOPIC_LEN: usize = 4;
/// Topics kept in a digest.
const TOP_K: usize = 5;

/// Build a deterministic digest of compressed history entries.
///
/// Picks the top-k most frequent words (ties broken alphabetically) and
/// names the participant when known.
#[must_use]
pub fn digest(texts: &[&str], participant: Option<&str>, previous: Option<&str>) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            let word = word.to_lowercase();
            if word.chars().count() >= MIN_TOPIC_LEN {
                *counts.entry(word).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let topics: Vec<String> = ranked.into_iter().take(TOP_K).map(|(w, _)| w).collect();

    let mut parts = Vec::new();
    if let Some(previous) = previous {
        if !previous.is_empty() {
            parts.push(previous.to_owned());
        }
    }
    let who = participant.map_or_else(|| "the user".to_owned(), str::to_owned);
    if topics.is_empty() {
        parts.push(format!("Earlier chat with {who}."));
    } else {
        parts.push(format!(
            "Earlier chat with {who} touched on: {}.",
            topics.join(", ")
        ));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let texts = ["I love hiking in the mountains", "mountains are great for hiking"];
        let a = digest(&texts, Some("lena"), None);
        let b = digest(&texts, Some("lena"), None);
        assert_eq!(a, b);
        assert!(a.contains("lena"));
        assert!(a.contains("mountains"));
        assert!(a.contains("hiking"));
    }

    #[test]
    fn test_digest_chains_previous() {
        let first = digest(&["talking about exams"], None, None);
        let second = digest(&["weekend plans and movies"], None, Some(&first));
        assert!(second.starts_with(&first));
        assert!(second.contains("weekend"));
    }

    #[test]
    fn test_short_words_ignored() {
        let rendered = digest(&["hi ok yes no", "so so so"], None, None);
        assert_eq!(rendered, "Earlier chat with the user.");
    }

    #[test]
    fn test_ties_break_alphabetically() {
        let rendered = digest(&["zebra apple zebra apple"], None, None);
        let apple = rendered.find("apple").unwrap();
        let zebra = rendered.find("zebra").unwrap();
        assert!(apple < zebra);
    }
}
