//! Core domain model for survey wide-results sync.
//!
//! Holds the types shared by the storage layer and the sync engine: surveyed
//! pages and their layout registry entries, raw action records and field
//! values, the pivoted wide rows, the target dialect, and the column
//! identifier normalizer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use deunicode::deunicode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "swr-core";

pub type PageId = i64;
pub type ActionId = i64;

/// Page catalog `type` marker of pages eligible for sync.
pub const SURVEY_PAGE_TYPE: &str = "Survey";
/// Key column present first in every destination table.
pub const ACTION_ID_COLUMN: &str = "action_id";
pub const COLUMN_LIST_DELIMITER: char = ',';
/// Joins multiple values sharing one field name within a single record.
pub const VALUE_SEPARATOR: &str = "; ";
pub const UNNAMED_FIELD: &str = "unnamed_field";
pub const RESERVED_KEYWORDS: [&str; 10] = [
    "union",
    "permissions",
    "select",
    "else",
    "when",
    "where",
    "order",
    "primary",
    "identity",
    "join",
];

const EPOCH: NaiveDateTime = match NaiveDate::from_ymd_opt(1900, 1, 1) {
    Some(date) => date.and_time(NaiveTime::MIN),
    None => panic!("1900-01-01 is a valid date"),
};

/// Watermark used for pages that have never been processed.
pub fn epoch() -> NaiveDateTime {
    EPOCH
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("Page {0} not found.")]
    NotFound(PageId),
    #[error("Page {0} is not a survey.")]
    NotSurvey(PageId),
    #[error("Results for survey {0} have not yet been loaded.")]
    NotLoaded(PageId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialectError {
    #[error("Database type {0} not found.")]
    InvalidDatabaseDialect(String),
}

/// Target engine of the reporting schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    Postgres,
    Redshift,
}

impl Dialect {
    /// Column type used for every free-text destination column.
    pub fn text_column_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "VARCHAR",
            Dialect::Redshift => "VARCHAR(MAX)",
        }
    }

    /// Engine-side clock expression yielding a `TIMESTAMP` without time zone.
    pub fn current_timestamp_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "LOCALTIMESTAMP",
            Dialect::Redshift => "GETDATE()",
        }
    }

    /// Longest identifier the engine keeps without silently truncating.
    pub fn max_identifier_len(&self) -> usize {
        match self {
            Dialect::Postgres => 63,
            Dialect::Redshift => 127,
        }
    }
}

impl FromStr for Dialect {
    type Err = DialectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" => Ok(Dialect::Postgres),
            "redshift" => Ok(Dialect::Redshift),
            _ => Err(DialectError::InvalidDatabaseDialect(s.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => f.write_str("PostgreSQL"),
            Dialect::Redshift => f.write_str("Redshift"),
        }
    }
}

/// One row of the raw action store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawActionRecord {
    pub id: ActionId,
    pub page_id: PageId,
    pub created_at: NaiveDateTime,
}

/// One free-form answer attached to an action record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFieldValue {
    pub action_id: ActionId,
    pub name: String,
    pub value: Option<String>,
}

/// Ordered destination column list as persisted in the layout registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnList(Vec<String>);

impl ColumnList {
    pub fn new(columns: Vec<String>) -> Self {
        Self(columns)
    }

    pub fn from_stored(stored: &str) -> Self {
        Self(
            stored
                .split(COLUMN_LIST_DELIMITER)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn to_stored(&self) -> String {
        self.0.join(&COLUMN_LIST_DELIMITER.to_string())
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c == column)
    }

    /// Candidate columns absent from this list, in candidate order.
    pub fn missing<'a>(&self, candidates: &'a [String]) -> Vec<&'a str> {
        let known: HashSet<&str> = self.0.iter().map(String::as_str).collect();
        candidates
            .iter()
            .map(String::as_str)
            .filter(|c| !known.contains(c))
            .collect()
    }
}

/// Layout registry row: the page's destination columns and its watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub page_id: PageId,
    pub column_list: ColumnList,
    pub last_refresh: NaiveDateTime,
}

/// Where to move a page watermark to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkAt {
    At(NaiveDateTime),
    /// Engine clock at the moment the update runs.
    Now,
}

/// Result of a refresh probe on a loaded survey page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(rename = "type")]
    pub page_type: String,
    pub page_id: PageId,
    pub column_list: String,
    pub last_refresh: NaiveDateTime,
    pub action_count: i64,
    pub saved_count: i64,
}

/// A survey page with records newer than its watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalePage {
    pub page_id: PageId,
    pub since: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildReason {
    #[serde(rename = "column(s) added")]
    ColumnsAdded,
    #[serde(rename = "survey schema missing")]
    SchemaMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ProcessOutcome {
    #[serde(rename = "processed")]
    Processed { actions: usize },
    /// The destination was rebuilt; the batch stays unmerged until the next pass.
    #[serde(rename = "schema updated")]
    SchemaUpdated { reason: RebuildReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum DispatchSummary {
    #[serde(rename = "processed")]
    Processed {
        pages: Vec<StalePage>,
        results: BTreeMap<PageId, ProcessOutcome>,
    },
    #[serde(rename = "processing asynchronously")]
    Dispatched { pages: Vec<StalePage> },
}

/// One reporting row per action record, keyed by normalized column name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WideRow {
    pub action_id: ActionId,
    pub cells: BTreeMap<String, String>,
}

impl WideRow {
    pub fn new(action_id: ActionId) -> Self {
        Self {
            action_id,
            cells: BTreeMap::new(),
        }
    }

    pub fn cell(&self, column: &str) -> &str {
        self.cells.get(column).map(String::as_str).unwrap_or_default()
    }

    /// Adds a value, appending to a non-empty cell with [`VALUE_SEPARATOR`].
    pub fn push_value(&mut self, column: &str, value: &str) {
        match self.cells.get_mut(column) {
            Some(existing) if !existing.is_empty() => {
                existing.push_str(VALUE_SEPARATOR);
                existing.push_str(value);
            }
            Some(existing) => *existing = value.to_string(),
            None => {
                self.cells.insert(column.to_string(), value.to_string());
            }
        }
    }
}

/// Latest `created_at` across the records, or [`epoch`] for an empty slice.
pub fn max_created_at(records: &[RawActionRecord]) -> NaiveDateTime {
    records
        .iter()
        .map(|r| r.created_at)
        .max()
        .unwrap_or_else(epoch)
}

/// Pivots field values into one wide row per action id.
///
/// Rows follow `action_ids` order and every id gets a row even without
/// values. Values whose raw name has no entry in `name_map` are skipped.
pub fn pivot_field_values(
    action_ids: &[ActionId],
    values: &[RawFieldValue],
    name_map: &HashMap<String, String>,
) -> Vec<WideRow> {
    let mut rows: Vec<WideRow> = Vec::with_capacity(action_ids.len());
    let mut index: HashMap<ActionId, usize> = HashMap::with_capacity(action_ids.len());
    for &id in action_ids {
        index.entry(id).or_insert_with(|| {
            rows.push(WideRow::new(id));
            rows.len() - 1
        });
    }

    for value in values {
        let Some(column) = name_map.get(&value.name) else {
            continue;
        };
        let slot = *index.entry(value.action_id).or_insert_with(|| {
            rows.push(WideRow::new(value.action_id));
            rows.len() - 1
        });
        rows[slot].push_value(column, value.value.as_deref().unwrap_or_default());
    }

    rows
}

/// Turns free-text field names into safe, unique column identifiers.
#[derive(Debug, Clone)]
pub struct ColumnNormalizer {
    max_len: usize,
}

impl Default for ColumnNormalizer {
    fn default() -> Self {
        Self::for_dialect(Dialect::Postgres)
    }
}

impl ColumnNormalizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(8),
        }
    }

    pub fn for_dialect(dialect: Dialect) -> Self {
        Self::new(dialect.max_identifier_len())
    }

    /// Transliterated, lower-cased ASCII slug with non-alphanumeric runs
    /// collapsed to `_`.
    pub fn slugify(raw: &str) -> String {
        let ascii = deunicode(raw);
        let mut slug = String::with_capacity(ascii.len());
        let mut pending_separator = false;
        for ch in ascii.chars().map(|c| c.to_ascii_lowercase()) {
            if ch.is_ascii_alphanumeric() {
                if pending_separator && !slug.is_empty() {
                    slug.push('_');
                }
                pending_separator = false;
                slug.push(ch);
            } else {
                pending_separator = true;
            }
        }
        slug
    }

    /// Normalizes one ordered batch of raw names.
    ///
    /// Output has the input's length and order. Dedup state is local to the
    /// call, so the same batch always yields the same columns. The key column
    /// counts as already taken, so a field slugged to it gets a suffix.
    pub fn normalize_batch<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        let mut taken: HashSet<String> = HashSet::from([ACTION_ID_COLUMN.to_string()]);
        let mut occurrences: HashMap<String, usize> =
            HashMap::from([(ACTION_ID_COLUMN.to_string(), 1)]);
        let mut columns = Vec::with_capacity(names.len());

        for raw in names {
            let base = self.base_identifier(raw.as_ref());
            let seen = occurrences.entry(base.clone()).or_insert(0);
            let column = if *seen == 0 && !taken.contains(&base) {
                base.clone()
            } else {
                let mut n = *seen + 1;
                loop {
                    let suffix = n.to_string();
                    let candidate = format!("{}{}", self.fit(&base, suffix.len()), suffix);
                    if !taken.contains(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            };
            *seen += 1;
            taken.insert(column.clone());
            columns.push(column);
        }

        columns
    }

    fn base_identifier(&self, raw: &str) -> String {
        let mut name = Self::slugify(raw);
        if name.is_empty() {
            name = UNNAMED_FIELD.to_string();
        }
        if RESERVED_KEYWORDS.contains(&name.as_str()) {
            name.push_str("_q");
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert_str(0, "q_");
        }
        self.fit(&name, 0)
    }

    /// Truncates `name` so that `reserve` more bytes still fit the limit.
    fn fit(&self, name: &str, reserve: usize) -> String {
        let limit = self.max_len.saturating_sub(reserve);
        if name.len() <= limit {
            return name.to_string();
        }
        name[..limit].trim_end_matches('_').to_string()
    }
}
