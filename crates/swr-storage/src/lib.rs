//! sqlx access layer for the source action schema and the survey reporting schema.
//!
//! Every dynamic identifier (schema names, per-page table names, normalized
//! column names) passes through [`quote_identifier`] before it is spliced
//! into SQL text. Values are always bound as parameters.

use chrono::NaiveDateTime;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use swr_core::{
    epoch, ActionId, ColumnList, Dialect, LayoutEntry, PageId, RawActionRecord, RawFieldValue,
    StalePage, WatermarkAt, WideRow, ACTION_ID_COLUMN, SURVEY_PAGE_TYPE,
};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "swr-storage";

/// Registry table inside the survey schema.
pub const REGISTRY_TABLE: &str = "pages";

/// Postgres wire protocol limit on bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;
/// Ids bound per `IN (...)` list.
const ID_CHUNK: usize = 10_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },
}

pub fn validate_identifier(name: &str, max_len: usize) -> Result<(), StorageError> {
    let invalid = |reason: String| StorageError::InvalidIdentifier {
        name: name.to_string(),
        reason,
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("identifier must not be empty".to_string()));
    };
    if name.len() > max_len {
        return Err(invalid(format!(
            "exceeds maximum length of {max_len} bytes (got {})",
            name.len()
        )));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(format!(
            "must start with a letter or underscore, got '{first}'"
        )));
    }
    if let Some(ch) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(invalid(format!("contains invalid character '{ch}'")));
    }
    Ok(())
}

/// Validates and double-quotes an identifier for interpolation into SQL.
pub fn quote_identifier(name: &str, max_len: usize) -> Result<String, StorageError> {
    validate_identifier(name, max_len)?;
    Ok(format!("\"{name}\""))
}

pub fn destination_table_name(page_id: PageId) -> String {
    format!("page_{page_id}")
}

/// `CREATE TABLE` statement for a destination table with the given columns.
pub fn create_table_sql(
    qualified_table: &str,
    columns: &[String],
    dialect: Dialect,
) -> Result<String, StorageError> {
    let max_len = dialect.max_identifier_len();
    let mut definitions = Vec::with_capacity(columns.len() + 1);
    definitions.push(format!("{} BIGINT", quote_identifier(ACTION_ID_COLUMN, max_len)?));
    for column in columns {
        definitions.push(format!(
            "{} {}",
            quote_identifier(column, max_len)?,
            dialect.text_column_type()
        ));
    }
    Ok(format!(
        "CREATE TABLE {qualified_table} ({})",
        definitions.join(", ")
    ))
}

/// Source and destination schema names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNames {
    pub source: String,
    pub survey: String,
}

/// Catalog, registry and record-count facts about one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProbe {
    pub page_type: Option<String>,
    pub layout: Option<LayoutEntry>,
    pub action_count: i64,
}

#[derive(Debug, Clone)]
pub struct SurveyStore {
    pool: PgPool,
    dialect: Dialect,
    survey_schema_name: String,
    source_schema: String,
    survey_schema: String,
}

impl SurveyStore {
    pub fn new(pool: PgPool, schemas: &SchemaNames, dialect: Dialect) -> Result<Self, StorageError> {
        let max_len = dialect.max_identifier_len();
        Ok(Self {
            source_schema: quote_identifier(&schemas.source, max_len)?,
            survey_schema: quote_identifier(&schemas.survey, max_len)?,
            survey_schema_name: schemas.survey.clone(),
            pool,
            dialect,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn quote(&self, name: &str) -> Result<String, StorageError> {
        quote_identifier(name, self.dialect.max_identifier_len())
    }

    fn source_table(&self, table: &str) -> String {
        format!("{}.\"{table}\"", self.source_schema)
    }

    fn registry_table(&self) -> String {
        format!("{}.\"{REGISTRY_TABLE}\"", self.survey_schema)
    }

    fn destination_table(&self, page_id: PageId) -> Result<String, StorageError> {
        Ok(format!(
            "{}.{}",
            self.survey_schema,
            self.quote(&destination_table_name(page_id))?
        ))
    }

    /// Creates the survey schema and layout registry table when absent.
    pub async fn ensure_registry(&self) -> Result<(), StorageError> {
        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", self.survey_schema);
        sqlx::query(&create_schema).execute(&self.pool).await?;

        let create_registry = format!(
            "CREATE TABLE IF NOT EXISTS {} (page_id BIGINT, last_refresh TIMESTAMP, column_list {})",
            self.registry_table(),
            self.dialect.text_column_type()
        );
        debug!(sql = %create_registry, "ensuring layout registry");
        sqlx::query(&create_registry).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns `None` when the page catalog has no row for `page_id`.
    pub async fn page_probe(&self, page_id: PageId) -> Result<Option<PageProbe>, StorageError> {
        let sql = format!(
            "SELECT p.type AS page_type,
                    sr.page_id::BIGINT AS layout_page_id,
                    sr.column_list AS column_list,
                    sr.last_refresh AS last_refresh,
                    COUNT(a.id)::BIGINT AS action_count
             FROM {pages} p
             LEFT JOIN {registry} sr ON sr.page_id = p.id
             LEFT JOIN {actions} a ON a.page_id = p.id
             WHERE p.id = $1
             GROUP BY p.type, sr.page_id, sr.column_list, sr.last_refresh",
            pages = self.source_table("core_page"),
            registry = self.registry_table(),
            actions = self.source_table("core_action"),
        );
        let rows = sqlx::query(&sql).bind(page_id).fetch_all(&self.pool).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let layout_page_id: Option<i64> = row.try_get("layout_page_id")?;
        let layout = match layout_page_id {
            Some(layout_page_id) => {
                let column_list: Option<String> = row.try_get("column_list")?;
                let last_refresh: Option<NaiveDateTime> = row.try_get("last_refresh")?;
                Some(LayoutEntry {
                    page_id: layout_page_id,
                    column_list: ColumnList::from_stored(column_list.as_deref().unwrap_or_default()),
                    last_refresh: last_refresh.unwrap_or_else(epoch),
                })
            }
            None => None,
        };

        Ok(Some(PageProbe {
            page_type: row.try_get("page_type")?,
            layout,
            action_count: row.try_get("action_count")?,
        }))
    }

    /// The page's layout registry row, if any.
    pub async fn layout_entry(&self, page_id: PageId) -> Result<Option<LayoutEntry>, StorageError> {
        let sql = format!(
            "SELECT page_id::BIGINT AS page_id, column_list, last_refresh
             FROM {} WHERE page_id = $1",
            self.registry_table()
        );
        let row = sqlx::query(&sql)
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let column_list: Option<String> = row.try_get("column_list")?;
        let last_refresh: Option<NaiveDateTime> = row.try_get("last_refresh")?;
        Ok(Some(LayoutEntry {
            page_id: row.try_get("page_id")?,
            column_list: ColumnList::from_stored(column_list.as_deref().unwrap_or_default()),
            last_refresh: last_refresh.unwrap_or_else(epoch),
        }))
    }

    pub async fn destination_exists(&self, page_id: PageId) -> Result<bool, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::BIGINT FROM information_schema.tables
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&self.survey_schema_name)
        .bind(destination_table_name(page_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn saved_count(&self, page_id: PageId) -> Result<i64, StorageError> {
        let sql = format!(
            "SELECT COUNT(pa.{action_id})::BIGINT FROM {table} pa",
            action_id = self.quote(ACTION_ID_COLUMN)?,
            table = self.destination_table(page_id)?,
        );
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Records created at or after `since`, oldest first, at most `limit`.
    pub async fn recent_records(
        &self,
        page_id: PageId,
        since: NaiveDateTime,
        limit: usize,
    ) -> Result<Vec<RawActionRecord>, StorageError> {
        let sql = format!(
            "SELECT a.id::BIGINT AS id, a.page_id::BIGINT AS page_id, a.created_at::TIMESTAMP AS created_at
             FROM {actions} a
             WHERE a.page_id = $1
               AND a.created_at >= $2
             ORDER BY a.created_at ASC
             LIMIT {limit}",
            actions = self.source_table("core_action"),
        );
        let rows = sqlx::query(&sql)
            .bind(page_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(RawActionRecord {
                    id: row.try_get("id")?,
                    page_id: row.try_get("page_id")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Field values of the given records, skipping empty and excluded names.
    ///
    /// Ordered by record then by field value id, which is insertion order.
    pub async fn field_values_for(
        &self,
        action_ids: &[ActionId],
        excludes: &[String],
    ) -> Result<Vec<RawFieldValue>, StorageError> {
        let mut values = Vec::new();
        for chunk in action_ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "SELECT af.parent_id::BIGINT AS action_id, af.name AS name, af.value AS value
                 FROM {} af
                 WHERE af.parent_id IN (",
                self.source_table("core_actionfield")
            ));
            let mut ids = qb.separated(", ");
            for id in chunk {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
            qb.push(" AND af.name <> ''");
            push_name_excludes(&mut qb, excludes);
            qb.push(" ORDER BY af.parent_id, af.id");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                values.push(RawFieldValue {
                    action_id: row.try_get("action_id")?,
                    name: row.try_get("name")?,
                    value: row.try_get("value")?,
                });
            }
        }
        Ok(values)
    }

    /// Every distinct field name ever recorded for the page, sorted.
    pub async fn field_names_for_page(
        &self,
        page_id: PageId,
        excludes: &[String],
    ) -> Result<Vec<String>, StorageError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT DISTINCT af.name AS name
             FROM {fields} af
             JOIN {actions} a ON a.id = af.parent_id
             WHERE a.page_id = ",
            fields = self.source_table("core_actionfield"),
            actions = self.source_table("core_action"),
        ));
        qb.push_bind(page_id);
        qb.push(" AND af.name <> ''");
        push_name_excludes(&mut qb, excludes);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut names = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;
        names.sort();
        Ok(names)
    }

    /// Drops and recreates the page's destination table in one transaction.
    pub async fn rebuild_destination(
        &self,
        page_id: PageId,
        columns: &[String],
    ) -> Result<(), StorageError> {
        let table = self.destination_table(page_id)?;
        let drop = format!("DROP TABLE IF EXISTS {table}");
        let create = create_table_sql(&table, columns, self.dialect)?;
        debug!(sql = %create, "recreating destination table");

        let mut tx = self.pool.begin().await?;
        sqlx::query(&drop).execute(&mut *tx).await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        tx.commit().await?;

        info!(page_id, columns = columns.len(), "destination table rebuilt");
        Ok(())
    }

    /// Replaces the page's registry row; the new watermark is [`epoch`].
    pub async fn replace_layout(
        &self,
        page_id: PageId,
        columns: &[String],
    ) -> Result<(), StorageError> {
        let registry = self.registry_table();
        let delete = format!("DELETE FROM {registry} WHERE page_id = $1");
        let insert = format!(
            "INSERT INTO {registry} (page_id, column_list, last_refresh) VALUES ($1, $2, $3)"
        );
        let column_list = ColumnList::new(columns.to_vec());

        let mut tx = self.pool.begin().await?;
        sqlx::query(&delete).bind(page_id).execute(&mut *tx).await?;
        sqlx::query(&insert)
            .bind(page_id)
            .bind(column_list.to_stored())
            .bind(epoch())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Moves only the watermark column; returns the number of registry rows touched.
    pub async fn advance_watermark(
        &self,
        page_id: PageId,
        at: WatermarkAt,
    ) -> Result<u64, StorageError> {
        let registry = self.registry_table();
        let result = match at {
            WatermarkAt::At(ts) => {
                let sql = format!("UPDATE {registry} SET last_refresh = $1 WHERE page_id = $2");
                sqlx::query(&sql).bind(ts).bind(page_id).execute(&self.pool).await?
            }
            WatermarkAt::Now => {
                let sql = format!(
                    "UPDATE {registry} SET last_refresh = {} WHERE page_id = $1",
                    self.dialect.current_timestamp_sql()
                );
                sqlx::query(&sql).bind(page_id).execute(&self.pool).await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Deletes the rows' action ids from the destination, then inserts the rows.
    ///
    /// Runs as one transaction. Cells for `columns` missing from a row are
    /// written as empty strings.
    pub async fn merge_rows(
        &self,
        page_id: PageId,
        columns: &[String],
        rows: &[WideRow],
    ) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = self.destination_table(page_id)?;
        let action_id = self.quote(ACTION_ID_COLUMN)?;
        let mut insert_columns = vec![action_id.clone()];
        for column in columns {
            insert_columns.push(self.quote(column)?);
        }
        let insert_head = format!("INSERT INTO {table} ({}) ", insert_columns.join(", "));
        let action_ids: Vec<ActionId> = rows.iter().map(|r| r.action_id).collect();

        let mut tx = self.pool.begin().await?;
        for chunk in action_ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("DELETE FROM {table} WHERE {action_id} IN ("));
            let mut ids = qb.separated(", ");
            for id in chunk {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
            qb.build().execute(&mut *tx).await?;
        }

        let rows_per_statement = (MAX_BIND_PARAMS / insert_columns.len()).max(1);
        for chunk in rows.chunks(rows_per_statement) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(insert_head.as_str());
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.action_id);
                for column in columns {
                    b.push_bind(row.cell(column).to_string());
                }
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(page_id, rows = rows.len(), "merged wide rows");
        Ok(rows.len())
    }

    /// Survey pages whose layout is missing or that have records newer than
    /// the watermark, highest page id first.
    pub async fn stale_pages(&self, limit: usize) -> Result<Vec<StalePage>, StorageError> {
        let sql = format!(
            "SELECT DISTINCT p.id::BIGINT AS page_id,
                    COALESCE(sr.last_refresh, $2) AS since
             FROM {actions} a
             JOIN {pages} p ON p.id = a.page_id
             LEFT JOIN {registry} sr ON sr.page_id = p.id
             WHERE p.type = $1
               AND (sr.page_id IS NULL OR sr.last_refresh < a.created_at)
             ORDER BY page_id DESC
             LIMIT {limit}",
            actions = self.source_table("core_action"),
            pages = self.source_table("core_page"),
            registry = self.registry_table(),
        );
        let rows = sqlx::query(&sql)
            .bind(SURVEY_PAGE_TYPE)
            .bind(epoch())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(StalePage {
                    page_id: row.try_get("page_id")?,
                    since: row.try_get("since")?,
                })
            })
            .collect()
    }
}

fn push_name_excludes(qb: &mut QueryBuilder<'_, Postgres>, excludes: &[String]) {
    if excludes.is_empty() {
        return;
    }
    qb.push(" AND af.name NOT IN (");
    let mut names = qb.separated(", ");
    for name in excludes {
        names.push_bind(name.clone());
    }
    names.push_unseparated(")");
}
