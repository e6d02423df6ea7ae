//! Source tables, column roles and lenient scalar parsing.
//!
//! A [`Dataset`] is the immutable input of every generation run. Column roles
//! say which columns hold the main label, sub label, item name and the
//! promoted scalar fields; when the caller gives none they are inferred from
//! header keywords and cell contents.

use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::{GroupingError, PromotedFields, Result};

/// Number of leading rows inspected when inferring column roles.
const INFERENCE_SAMPLE_ROWS: usize = 100;

/// Fraction of cells that must match for a content-based column guess.
const INFERENCE_MIN_RATIO: f64 = 0.7;

const CATEGORY_KEYWORDS: &[&str] = &["category", "type", "class", "group", "dept"];
const PRICE_KEYWORDS: &[&str] = &["price", "cost", "amount", "value", "rate"];
const QUANTITY_KEYWORDS: &[&str] = &["quantity", "qty", "count", "number", "stock"];
const NAME_KEYWORDS: &[&str] = &["name", "item", "product", "description"];

/// An in-memory table of string cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    pub fn new(id: impl Into<String>, columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            id: id.into(),
            columns,
            rows,
        }
    }

    /// Read a dataset from UTF-8 CSV with a header row.
    ///
    /// Short records are padded with empty cells; long records are truncated
    /// to the header width.
    pub fn from_csv_reader<R: Read>(id: impl Into<String>, reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        if columns.is_empty() {
            return Err(GroupingError::Dataset("CSV has no header row".to_string()));
        }

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().take(columns.len()).map(str::to_string).collect();
            row.resize(columns.len(), String::new());
            rows.push(row);
        }

        log::info!(
            "[Dataset] Read {} rows x {} columns",
            rows.len(),
            columns.len()
        );
        Ok(Self::new(id, columns, rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by exact header name, falling back to a
    /// case-insensitive match.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(name.trim()))
            })
    }

    /// Like [`Dataset::column_index`] but failing with a dataset error.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| GroupingError::Dataset(format!("Unknown column '{}'", name)))
    }

    /// Cell value, or an empty string for a missing cell.
    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The full row as a column -> value map.
    pub fn row_map(&self, row: usize) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .enumerate()
            .map(|(c, name)| (name.clone(), self.cell(row, c).to_string()))
            .collect()
    }

    fn sample_column(&self, column: usize) -> impl Iterator<Item = &str> {
        (0..self.rows.len().min(INFERENCE_SAMPLE_ROWS))
            .map(move |r| self.cell(r, column))
            .filter(|v| !v.is_empty())
    }

    fn column_ratio(&self, column: usize, pred: impl Fn(&str) -> bool) -> f64 {
        let mut total = 0usize;
        let mut hits = 0usize;
        for value in self.sample_column(column) {
            total += 1;
            if pred(value) {
                hits += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn column_by_keywords(&self, keywords: &[&str]) -> Option<usize> {
        self.columns.iter().position(|c| {
            let lower = c.to_lowercase();
            keywords.iter().any(|k| lower.contains(k))
        })
    }

    fn detect_category_column(&self) -> Option<usize> {
        self.column_by_keywords(CATEGORY_KEYWORDS).or_else(|| {
            (1..self.columns.len().min(5)).find(|&c| {
                self.column_ratio(c, |v| parse_number(v).is_none()) > INFERENCE_MIN_RATIO
            })
        })
    }

    fn detect_price_column(&self) -> Option<usize> {
        self.column_by_keywords(PRICE_KEYWORDS).or_else(|| {
            (1..self.columns.len().min(5)).find(|&c| {
                self.column_ratio(c, |v| parse_number(v).is_some()) > INFERENCE_MIN_RATIO
            })
        })
    }

    fn detect_quantity_column(&self) -> Option<usize> {
        self.column_by_keywords(QUANTITY_KEYWORDS)
    }

    fn detect_name_column(&self, category: Option<usize>) -> Option<usize> {
        self.columns
            .iter()
            .enumerate()
            .position(|(i, c)| {
                let lower = c.to_lowercase();
                Some(i) != category && NAME_KEYWORDS.iter().any(|k| lower.contains(k))
            })
            .or_else(|| (0..self.columns.len()).find(|&i| Some(i) != category))
    }

    /// Resolve column roles against this dataset, inferring anything unset.
    pub fn resolve_columns(&self, roles: Option<&ColumnRoles>) -> Result<ResolvedColumns> {
        let lookup = |name: &Option<String>| -> Result<Option<usize>> {
            name.as_deref().map(|n| self.require_column(n)).transpose()
        };

        let resolved = match roles {
            Some(roles) => {
                let main = lookup(&roles.main_group_column)?
                    .or_else(|| self.detect_category_column());
                let sub = lookup(&roles.sub_group_column)?;
                let category = lookup(&roles.category_column)?.or(main);
                let item_name = match lookup(&roles.item_name_column)? {
                    Some(c) => Some(c),
                    None => self.detect_name_column(main),
                };
                ResolvedColumns {
                    main,
                    sub,
                    item_name,
                    price: match lookup(&roles.price_column)? {
                        Some(c) => Some(c),
                        None => self.detect_price_column(),
                    },
                    category,
                    quantity: match lookup(&roles.quantity_column)? {
                        Some(c) => Some(c),
                        None => self.detect_quantity_column(),
                    },
                }
            }
            None => {
                let category = self.detect_category_column();
                ResolvedColumns {
                    main: category,
                    sub: None,
                    item_name: self.detect_name_column(category),
                    price: self.detect_price_column(),
                    category,
                    quantity: self.detect_quantity_column(),
                }
            }
        };

        log::debug!("[Dataset] Resolved columns for '{}': {:?}", self.id, resolved);
        Ok(resolved)
    }
}

/// Caller-supplied column roles, by header name. Unset roles are inferred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnRoles {
    pub main_group_column: Option<String>,
    pub sub_group_column: Option<String>,
    pub item_name_column: Option<String>,
    pub price_column: Option<String>,
    pub category_column: Option<String>,
    pub quantity_column: Option<String>,
}

/// Column roles resolved to indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub main: Option<usize>,
    pub sub: Option<usize>,
    pub item_name: Option<usize>,
    pub price: Option<usize>,
    pub category: Option<usize>,
    pub quantity: Option<usize>,
}

impl ResolvedColumns {
    /// Display name of a row.
    pub fn item_name(&self, dataset: &Dataset, row: usize) -> String {
        let raw = self
            .item_name
            .map(|c| dataset.cell(row, c))
            .unwrap_or("");
        if raw.trim().is_empty() {
            format!("Item {}", row + 1)
        } else {
            raw.trim().to_string()
        }
    }

    /// Promoted scalar fields of a row.
    pub fn promoted(&self, dataset: &Dataset, row: usize) -> PromotedFields {
        let defaults = PromotedFields::default();
        PromotedFields {
            price: self
                .price
                .and_then(|c| parse_number(dataset.cell(row, c)))
                .unwrap_or(defaults.price),
            category: self
                .category
                .map(|c| dataset.cell(row, c).trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .unwrap_or(defaults.category),
            quantity: self
                .quantity
                .and_then(|c| parse_number(dataset.cell(row, c)))
                .map(|q| q as i64)
                .unwrap_or(defaults.quantity),
        }
    }
}

/// Column selection for configured (non-sampled) generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// When false, the sub-group column alone defines the groups.
    #[serde(default = "default_use_main_groups")]
    pub use_main_groups: bool,
    #[serde(default)]
    pub main_group_column: Option<String>,
    pub sub_group_column: Option<String>,
}

fn default_use_main_groups() -> bool {
    true
}

/// Lenient numeric parse: strips `$`, `,` and surrounding whitespace.
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}
