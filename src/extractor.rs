//! Pattern extraction: turning a chunk sample into label triples.
//!
//! A [`Classifier`] proposes `(main label, sub label, item name)` for sampled
//! rows. The [`PatternExtractor`] runs a classifier under a deadline and
//! reports failures per chunk instead of failing the whole run.
//!
//! Built-in classifiers:
//! - [`ColumnClassifier`] reads labels straight from the resolved columns
//! - [`KeywordClassifier`] scores item names against a product keyword table
//! - `HttpClassifier` (feature `http`) asks a chat-completion endpoint

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::matching::clean_label;
use crate::sampler::{ChunkSample, SampleRow};
use crate::{GroupingError, Result, DEFAULT_SUB_GROUP_NAME};

// ============================================================================
// Classifier capability
// ============================================================================

/// Labels proposed for one sampled row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTriple {
    /// Source row the labels apply to
    pub row: usize,
    pub main_label: String,
    /// `None` sends the row to the main group's ungrouped sub-group
    pub sub_label: Option<String>,
    pub item_name: String,
}

/// Something that can label the rows of a chunk sample.
///
/// Implementations may omit rows they cannot label; those rows are assigned
/// later by label matching like any unsampled row.
pub trait Classifier: Send + Sync {
    fn classify(&self, sample: &ChunkSample) -> Result<Vec<LabelTriple>>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "classifier"
    }
}

/// Display name of a sampled row, falling back to its 1-based position.
pub fn sample_item_name(sample: &ChunkSample, row: &SampleRow) -> String {
    let name = sample.value(row, sample.roles.item_name);
    if name.is_empty() {
        format!("Item {}", row.row + 1)
    } else {
        name.to_string()
    }
}

// ============================================================================
// Extraction under a deadline
// ============================================================================

/// Result of running the classifier on one chunk.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub result: Result<Vec<LabelTriple>>,
    pub elapsed_ms: u64,
}

impl ChunkOutcome {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

/// Runs a classifier against chunk samples, bounded by a timeout.
#[derive(Clone)]
pub struct PatternExtractor {
    classifier: Arc<dyn Classifier>,
    timeout: Duration,
}

impl PatternExtractor {
    pub fn new(classifier: Arc<dyn Classifier>, timeout_ms: u64) -> Self {
        Self {
            classifier,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Classify one chunk sample.
    ///
    /// The classifier runs on its own thread; if it does not answer within the
    /// timeout the chunk is reported as failed and the late answer is dropped.
    /// Triples naming rows outside the sample are discarded.
    pub fn extract(&self, sample: Arc<ChunkSample>) -> ChunkOutcome {
        let chunk_index = sample.chunk_index;
        let start = Instant::now();
        let (tx, rx) = mpsc::channel();

        let classifier = Arc::clone(&self.classifier);
        let worker_sample = Arc::clone(&sample);
        let spawned = thread::Builder::new()
            .name(format!("extract-{}", chunk_index))
            .spawn(move || {
                let _ = tx.send(classifier.classify(&worker_sample));
            });

        let result = match spawned {
            Err(e) => Err(GroupingError::Extractor {
                chunk_index,
                message: format!("failed to spawn worker: {}", e),
            }),
            Ok(_) => match rx.recv_timeout(self.timeout) {
                Ok(Ok(triples)) => Ok(retain_sampled(&sample, triples)),
                Ok(Err(e)) => Err(match e {
                    GroupingError::Extractor { .. } | GroupingError::ExtractorTimeout { .. } => e,
                    other => GroupingError::Extractor {
                        chunk_index,
                        message: other.to_string(),
                    },
                }),
                Err(mpsc::RecvTimeoutError::Timeout) => Err(GroupingError::ExtractorTimeout {
                    chunk_index,
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(GroupingError::Extractor {
                    chunk_index,
                    message: "classifier worker panicked".to_string(),
                }),
            },
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(triples) => log::debug!(
                "[PatternExtractor] Chunk {}: {} triples from {} sampled rows in {}ms",
                chunk_index,
                triples.len(),
                sample.sample.len(),
                elapsed_ms
            ),
            Err(e) => log::warn!("[PatternExtractor] Chunk {} failed: {}", chunk_index, e),
        }

        ChunkOutcome {
            chunk_index,
            result,
            elapsed_ms,
        }
    }
}

fn retain_sampled(sample: &ChunkSample, triples: Vec<LabelTriple>) -> Vec<LabelTriple> {
    let before = triples.len();
    let kept: Vec<LabelTriple> = triples
        .into_iter()
        .filter(|t| sample.sample.iter().any(|r| r.row == t.row))
        .filter(|t| !t.main_label.trim().is_empty())
        .collect();
    if kept.len() < before {
        log::warn!(
            "[PatternExtractor] Chunk {}: dropped {} triples for rows outside the sample",
            sample.chunk_index,
            before - kept.len()
        );
    }
    kept
}

// ============================================================================
// Column classifier
// ============================================================================

/// Reads labels directly from the main/sub columns.
///
/// Without a sub column every row goes to the `All Items` sub-group. Rows with
/// an empty main value are not labelled; rows with an empty sub value are sent
/// to the main group's ungrouped sub-group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnClassifier;

impl Classifier for ColumnClassifier {
    fn classify(&self, sample: &ChunkSample) -> Result<Vec<LabelTriple>> {
        let roles = sample.roles;
        let Some(main_col) = roles.main else {
            return Ok(Vec::new());
        };

        let triples = sample
            .sample
            .iter()
            .filter_map(|row| {
                let main = sample.value(row, Some(main_col));
                if main.is_empty() {
                    return None;
                }
                let sub_label = match roles.sub {
                    Some(c) => {
                        let sub = sample.value(row, Some(c));
                        (!sub.is_empty()).then(|| clean_label(sub))
                    }
                    None => Some(DEFAULT_SUB_GROUP_NAME.to_string()),
                };
                Some(LabelTriple {
                    row: row.row,
                    main_label: clean_label(main),
                    sub_label,
                    item_name: sample_item_name(sample, row),
                })
            })
            .collect();
        Ok(triples)
    }

    fn name(&self) -> &str {
        "columns"
    }
}

// ============================================================================
// Keyword classifier
// ============================================================================

/// Weight of a secondary keyword hit relative to a primary one.
const SECONDARY_WEIGHT: f64 = 0.7;

/// Primary hits at or above this score skip the secondary table.
const PRIMARY_SUFFICIENT: f64 = 0.8;

/// Scores at or below this produce no label.
const MIN_CONFIDENCE: f64 = 0.3;

struct KeywordCategory {
    label: &'static str,
    primary: &'static [&'static str],
    secondary: &'static [&'static str],
}

const PRODUCT_KEYWORDS: &[KeywordCategory] = &[
    KeywordCategory {
        label: "Electronics",
        primary: &["laptop", "computer", "phone", "tablet", "monitor", "screen", "display"],
        secondary: &[
            "keyboard", "mouse", "speaker", "headphone", "earphone", "camera", "printer",
            "scanner", "router", "modem",
        ],
    },
    KeywordCategory {
        label: "Furniture",
        primary: &["chair", "desk", "table", "sofa", "couch", "bed", "mattress"],
        secondary: &["cabinet", "shelf", "bookshelf", "wardrobe", "drawer", "dresser", "nightstand"],
    },
    KeywordCategory {
        label: "Office Supplies",
        primary: &["pen", "pencil", "paper", "notebook", "stapler", "clip"],
        secondary: &["folder", "binder", "marker", "eraser", "tape", "glue", "scissors"],
    },
    KeywordCategory {
        label: "Food & Beverages",
        primary: &["rice", "flour", "sugar", "salt", "oil", "pasta", "cereal", "bread"],
        secondary: &["milk", "cheese", "butter", "yogurt", "juice", "coffee", "tea", "water"],
    },
    KeywordCategory {
        label: "Clothing",
        primary: &["shirt", "pants", "dress", "shoes", "jacket", "sweater"],
        secondary: &["jeans", "socks", "hat", "gloves", "belt", "tie", "scarf"],
    },
    KeywordCategory {
        label: "Tools & Hardware",
        primary: &["hammer", "screwdriver", "drill", "saw", "wrench", "pliers"],
        secondary: &["measuring", "level", "knife", "blade", "bit", "nail", "screw", "bolt"],
    },
    KeywordCategory {
        label: "Cleaning & Hygiene",
        primary: &["detergent", "soap", "cleaner", "disinfectant", "bleach"],
        secondary: &["sponge", "brush", "vacuum", "mop", "tissue", "towel", "shampoo", "toothpaste"],
    },
    KeywordCategory {
        label: "Automotive",
        primary: &["tire", "battery", "oil", "filter", "brake"],
        secondary: &["light", "mirror", "seat", "engine", "wire", "fluid"],
    },
];

const BRAND_TOKENS: &[&str] = &[
    "apple", "samsung", "dell", "hp", "lenovo", "asus", "acer", "sony", "lg", "canon", "epson",
    "nike", "adidas", "microsoft", "google", "intel", "amd", "inc", "corp", "ltd", "llc", "co",
    "company", "model", "gen", "generation",
];

const COLOUR_TOKENS: &[&str] = &[
    "red", "blue", "green", "yellow", "orange", "purple", "pink", "black", "white", "grey", "gray",
    "brown", "silver", "gold", "bronze", "dark", "bright",
];

const SIZE_TOKENS: &[&str] = &[
    "small", "medium", "large", "xl", "xxl", "xs", "mini", "micro", "mega", "super", "extra", "kg",
    "g", "lb", "oz", "ml", "l", "mm", "cm", "m", "inch", "ft", "pack", "pcs", "pieces", "ct", "x",
];

/// Offline heuristic classifier over a fixed product keyword table.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// Strip brands, model numbers, colours and sizes from a product name.
    pub fn normalize_name(name: &str) -> Vec<String> {
        name.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .filter(|t| !t.chars().any(|c| c.is_ascii_digit()))
            .filter(|t| {
                !BRAND_TOKENS.contains(t) && !COLOUR_TOKENS.contains(t) && !SIZE_TOKENS.contains(t)
            })
            .map(str::to_string)
            .collect()
    }

    /// Best `(category label, keyword, score)` for a product name.
    pub fn score(name: &str) -> Option<KeywordHit> {
        let words = Self::normalize_name(name);
        let mut best: Option<KeywordHit> = None;

        scan_keywords(&words, |c| c.primary, 1.0, &mut best);
        if best.map_or(true, |(_, _, s)| s < PRIMARY_SUFFICIENT) {
            scan_keywords(&words, |c| c.secondary, SECONDARY_WEIGHT, &mut best);
        }

        best.filter(|(_, _, s)| *s > MIN_CONFIDENCE)
    }
}

/// `(category label, matched keyword, score)`
pub type KeywordHit = (&'static str, &'static str, f64);

fn scan_keywords(
    words: &[String],
    keywords: fn(&KeywordCategory) -> &'static [&'static str],
    weight: f64,
    best: &mut Option<KeywordHit>,
) {
    for category in PRODUCT_KEYWORDS {
        for &keyword in keywords(category) {
            for word in words {
                let hit = word.contains(keyword) || (word.len() >= 3 && keyword.contains(word.as_str()));
                if !hit {
                    continue;
                }
                let score = weight * keyword.len() as f64 / word.len().max(keyword.len()) as f64;
                if best.map_or(true, |(_, _, s)| score > s) {
                    *best = Some((category.label, keyword, score));
                }
            }
        }
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, sample: &ChunkSample) -> Result<Vec<LabelTriple>> {
        let triples = sample
            .sample
            .iter()
            .filter_map(|row| {
                let item_name = sample_item_name(sample, row);
                let (category, keyword, _) = Self::score(&item_name)?;
                Some(LabelTriple {
                    row: row.row,
                    main_label: category.to_string(),
                    sub_label: Some(clean_label(keyword)),
                    item_name,
                })
            })
            .collect();
        Ok(triples)
    }

    fn name(&self) -> &str {
        "keywords"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dataset, ResolvedColumns};

    fn sample(rows: Vec<Vec<&str>>, roles: ResolvedColumns) -> ChunkSample {
        let dataset = Dataset::new(
            "ds",
            vec!["Item".into(), "Category".into(), "Type".into()],
            rows.into_iter()
                .map(|r| r.into_iter().map(str::to_string).collect())
                .collect(),
        );
        let len = dataset.len();
        ChunkSample::draw(&dataset, 0, 0..len, roles, 100)
    }

    fn roles(sub: Option<usize>) -> ResolvedColumns {
        ResolvedColumns {
            main: Some(1),
            sub,
            item_name: Some(0),
            ..Default::default()
        }
    }

    struct SlowClassifier(u64);

    impl Classifier for SlowClassifier {
        fn classify(&self, _sample: &ChunkSample) -> Result<Vec<LabelTriple>> {
            thread::sleep(Duration::from_millis(self.0));
            Ok(Vec::new())
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn classify(&self, _sample: &ChunkSample) -> Result<Vec<LabelTriple>> {
            Err(GroupingError::Storage("upstream unavailable".into()))
        }
    }

    struct StrayClassifier;

    impl Classifier for StrayClassifier {
        fn classify(&self, _sample: &ChunkSample) -> Result<Vec<LabelTriple>> {
            Ok(vec![LabelTriple {
                row: 999,
                main_label: "Ghost".into(),
                sub_label: None,
                item_name: "Ghost".into(),
            }])
        }
    }

    #[test]
    fn test_column_classifier_default_sub_group() {
        let s = sample(vec![vec!["Apple", "fruit", ""], vec!["Carrot", "", ""]], roles(None));
        let triples = ColumnClassifier.classify(&s).unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].main_label, "Fruit");
        assert_eq!(triples[0].sub_label.as_deref(), Some(DEFAULT_SUB_GROUP_NAME));
        assert_eq!(triples[0].item_name, "Apple");
    }

    #[test]
    fn test_column_classifier_empty_sub_value() {
        let s = sample(
            vec![vec!["Apple", "Fruit", "pome"], vec!["Kiwi", "Fruit", ""]],
            roles(Some(2)),
        );
        let triples = ColumnClassifier.classify(&s).unwrap();
        assert_eq!(triples[0].sub_label.as_deref(), Some("Pome"));
        assert_eq!(triples[1].sub_label, None);
    }

    #[test]
    fn test_keyword_normalization() {
        let words = KeywordClassifier::normalize_name("Samsung Black 27\" Monitor X1000 Large");
        assert_eq!(words, vec!["monitor"]);
    }

    #[test]
    fn test_keyword_scoring() {
        let (category, keyword, score) = KeywordClassifier::score("Ergonomic Office Chair").unwrap();
        assert_eq!(category, "Furniture");
        assert_eq!(keyword, "chair");
        assert_eq!(score, 1.0);

        let (category, keyword, _) = KeywordClassifier::score("Wireless Keyboard").unwrap();
        assert_eq!(category, "Electronics");
        assert_eq!(keyword, "keyboard");

        assert!(KeywordClassifier::score("Mystery Widget").is_none());
    }

    #[test]
    fn test_keyword_classifier_labels() {
        let s = sample(vec![vec!["HP Laptop 15", "", ""], vec!["Thing", "", ""]], roles(None));
        let triples = KeywordClassifier.classify(&s).unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].main_label, "Electronics");
        assert_eq!(triples[0].sub_label.as_deref(), Some("Laptop"));
    }

    #[test]
    fn test_extractor_timeout() {
        let s = Arc::new(sample(vec![vec!["Apple", "Fruit", ""]], roles(None)));
        let extractor = PatternExtractor::new(Arc::new(SlowClassifier(500)), 20);
        let outcome = extractor.extract(s);
        assert!(matches!(
            outcome.result,
            Err(GroupingError::ExtractorTimeout { chunk_index: 0, timeout_ms: 20 })
        ));
    }

    #[test]
    fn test_extractor_wraps_classifier_errors() {
        let s = Arc::new(sample(vec![vec!["Apple", "Fruit", ""]], roles(None)));
        let extractor = PatternExtractor::new(Arc::new(FailingClassifier), 1000);
        let outcome = extractor.extract(s);
        assert!(outcome.is_failure());
        assert!(matches!(outcome.result, Err(GroupingError::Extractor { chunk_index: 0, .. })));
    }

    #[test]
    fn test_extractor_drops_rows_outside_sample() {
        let s = Arc::new(sample(vec![vec!["Apple", "Fruit", ""]], roles(None)));
        let extractor = PatternExtractor::new(Arc::new(StrayClassifier), 1000);
        let outcome = extractor.extract(s);
        assert!(outcome.result.unwrap().is_empty());
    }
}
