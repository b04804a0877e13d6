//! Source and survey data shared by the integration tests.

use anyhow::Result;
use chrono::NaiveDateTime;

use super::TestDb;

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("timestamp")
}

/// Pages 1 (Donation) and 2-5 (Survey); actions 1, 2, 3 on pages 2, 3, 4.
///
/// Page 4 is already loaded with its one record; page 5 has a layout row,
/// no destination table and no records.
pub async fn seed_reference_fixture(db: &TestDb) -> Result<()> {
    let sql = format!(
        "CREATE SCHEMA {schema};
         CREATE TABLE {pages} (id INTEGER PRIMARY KEY, type VARCHAR(16) NOT NULL);
         CREATE TABLE {actions} (id INTEGER PRIMARY KEY, page_id INTEGER NOT NULL, created_at TIMESTAMP NOT NULL);
         CREATE TABLE {fields} (id SERIAL PRIMARY KEY, parent_id INTEGER NOT NULL, name VARCHAR(255) NOT NULL, value TEXT);

         INSERT INTO {pages} (id, type) VALUES
             (1, 'Donation'), (2, 'Survey'), (3, 'Survey'), (4, 'Survey'), (5, 'Survey');
         INSERT INTO {actions} (id, page_id, created_at) VALUES
             (1, 2, '2018-10-01 01:01:01'),
             (2, 3, '2018-10-05 01:01:01'),
             (3, 4, '2018-10-06 01:01:01');
         INSERT INTO {fields} (parent_id, name, value) VALUES
             (1, 'name', 'value'),
             (2, 'another', 'a value'),
             (3, 'processed', 'yes');

         CREATE TABLE {page_4} (action_id BIGINT, processed VARCHAR);
         INSERT INTO {page_4} (action_id, processed) VALUES (3, 'yes');
         INSERT INTO {registry} (page_id, last_refresh, column_list) VALUES
             (4, '2018-10-06 01:01:01', 'processed'),
             (5, '2018-10-06 01:01:01', 'processed');",
        schema = format!("\"{}\"", db.config.source_schema),
        pages = db.source("core_page"),
        actions = db.source("core_action"),
        fields = db.source("core_actionfield"),
        page_4 = db.survey("page_4"),
        registry = db.survey("pages"),
    );
    sqlx::raw_sql(&sql).execute(&db.pool).await?;
    Ok(())
}

pub async fn insert_action(db: &TestDb, id: i64, page_id: i64, created_at: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (id, page_id, created_at) VALUES ($1, $2, $3)",
        db.source("core_action")
    );
    sqlx::query(&sql)
        .bind(id as i32)
        .bind(page_id as i32)
        .bind(ts(created_at))
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn insert_field(db: &TestDb, action_id: i64, name: &str, value: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (parent_id, name, value) VALUES ($1, $2, $3)",
        db.source("core_actionfield")
    );
    sqlx::query(&sql)
        .bind(action_id as i32)
        .bind(name)
        .bind(value)
        .execute(&db.pool)
        .await?;
    Ok(())
}

/// Destination rows of a page as `(action_id, cell)` for one text column.
pub async fn saved_cells(db: &TestDb, page_id: i64, column: &str) -> Result<Vec<(i64, Option<String>)>> {
    let sql = format!(
        "SELECT action_id, \"{column}\" FROM {} ORDER BY action_id",
        db.survey(&format!("page_{page_id}"))
    );
    Ok(sqlx::query_as(&sql).fetch_all(&db.pool).await?)
}

pub async fn last_refresh(db: &TestDb, page_id: i64) -> Result<Option<NaiveDateTime>> {
    let sql = format!(
        "SELECT last_refresh FROM {} WHERE page_id = $1",
        db.survey("pages")
    );
    let refreshed: Option<Option<NaiveDateTime>> = sqlx::query_scalar(&sql)
        .bind(page_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(refreshed.flatten())
}
