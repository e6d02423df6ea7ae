//! Label similarity scoring.
//!
//! Labels proposed by different chunks (or read from messy columns) rarely
//! agree character for character. Two labels are scored in three tiers:
//! - case-insensitive equality after whitespace collapse: 1.0
//! - equal normalized token sets: 0.9
//! - otherwise 0.8 x Jaccard overlap of the token sets
//!
//! With the default threshold of 0.6 a tier-3 match needs a Jaccard overlap of
//! at least 0.75.

use std::collections::BTreeSet;

/// Score for labels equal up to case and whitespace.
pub const EXACT_SCORE: f64 = 1.0;

/// Score for labels with equal normalized token sets.
pub const TOKEN_SET_SCORE: f64 = 0.9;

/// Weight applied to the Jaccard overlap for everything else.
pub const JACCARD_WEIGHT: f64 = 0.8;

const STOP_TOKENS: &[&str] = &["and"];

/// Result of matching a label against a candidate list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelMatch {
    /// Index into the candidate list
    pub index: usize,
    pub score: f64,
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Clean a label for display: collapse whitespace and title-case each word.
///
/// # Example
/// ```
/// use row_grouper::clean_label;
/// assert_eq!(clean_label("  office   SUPPLIES "), "Office Supplies");
/// ```
pub fn clean_label(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Key used for exact label lookups (lowercase, whitespace collapsed).
pub fn label_key(s: &str) -> String {
    collapse_whitespace(s).to_lowercase()
}

fn singular(token: &str) -> String {
    let n = token.len();
    let es_stem = ["ses", "xes", "zes", "ches", "shes"]
        .iter()
        .any(|suffix| token.ends_with(suffix));
    if token.ends_with("ies") && n > 4 {
        format!("{}y", &token[..n - 3])
    } else if es_stem && n > 4 {
        token[..n - 2].to_string()
    } else if token.ends_with('s') && !token.ends_with("ss") && n > 3 {
        token[..n - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Normalized token set: lowercase, split on non-alphanumerics, connective
/// words dropped, simple plurals stripped.
pub fn normalize_tokens(s: &str) -> BTreeSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_TOKENS.contains(t))
        .map(singular)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity of two labels in `[0, 1]`.
pub fn label_similarity(a: &str, b: &str) -> f64 {
    if label_key(a) == label_key(b) {
        return EXACT_SCORE;
    }
    let ta = normalize_tokens(a);
    let tb = normalize_tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    if ta == tb {
        return TOKEN_SET_SCORE;
    }
    JACCARD_WEIGHT * jaccard(&ta, &tb)
}

/// Best candidate for `label` scoring at least `threshold`.
///
/// Ties go to the earliest candidate, so when candidates are listed in
/// creation order the oldest group wins.
pub fn best_match<'a, I>(label: &str, candidates: I, threshold: f64) -> Option<LabelMatch>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<LabelMatch> = None;
    for (index, candidate) in candidates.into_iter().enumerate() {
        let score = label_similarity(label, candidate);
        if score < threshold {
            continue;
        }
        if best.map_or(true, |b| score > b.score) {
            best = Some(LabelMatch { index, score });
            if score >= EXACT_SCORE {
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_ignores_case_and_whitespace() {
        assert_eq!(label_similarity("Office  Supplies", "office supplies"), 1.0);
    }

    #[test]
    fn test_token_set_match() {
        assert_eq!(label_similarity("Fruits & Vegetables", "vegetable and fruit"), 0.9);
        assert_eq!(label_similarity("Boxes", "box"), 0.9);
        assert_eq!(label_similarity("Shoes", "shoe"), 0.9);
        assert_eq!(label_similarity("Glass", "glass"), 1.0);
        assert_eq!(label_similarity("Office Supplies", "office supply"), 0.9);
    }

    #[test]
    fn test_jaccard_tier() {
        // {red, wine, glass} vs {wine, glass}: jaccard 2/3
        let score = label_similarity("Red Wine Glass", "Wine Glass");
        assert!((score - 0.8 * 2.0 / 3.0).abs() < 1e-9);
        assert!(score < 0.6);

        assert_eq!(label_similarity("Laptops", "Chairs"), 0.0);
    }

    #[test]
    fn test_empty_labels_do_not_match_each_other() {
        assert_eq!(label_similarity("&", "-"), 0.0);
        assert_eq!(label_similarity("", ""), 1.0);
    }

    #[test]
    fn test_best_match_threshold_and_tie_break() {
        let candidates = ["Electronic", "Furniture", "electronics"];
        let m = best_match("Electronics", candidates.iter().copied(), 0.6).unwrap();
        // "electronics" is the exact match, beating the earlier token-set match
        assert_eq!(m.index, 2);
        assert_eq!(m.score, 1.0);

        let candidates = ["Electronic", "ELECTRONIC"];
        let m = best_match("electronics", candidates.iter().copied(), 0.6).unwrap();
        assert_eq!(m.index, 0);

        assert!(best_match("Garden", candidates.iter().copied(), 0.6).is_none());
    }

    #[test]
    fn test_clean_label() {
        assert_eq!(clean_label("kitchen   utensils"), "Kitchen Utensils");
        assert_eq!(clean_label("TOOLS"), "Tools");
        assert_eq!(clean_label("   "), "");
    }
}
