use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::{
    Document, DocumentStore, Filter, OrderBy, StoreError, ensure_object, validate_query,
};

/// [`DocumentStore`] over the `documents` table, evaluating filters and
/// ordering with SQLite's `json_extract`.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct DocumentRow {
    id: String,
    revision: i64,
    data: String,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            id: row.id,
            revision: row.revision,
            data: serde_json::from_str(&row.data)?,
        })
    }
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn select(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        validate_query(filters, order_by)?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, revision, data FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());

        for filter in filters {
            qb.push(" AND json_extract(data, ");
            qb.push_bind(json_path(&filter.field));
            qb.push(") = json_extract(");
            qb.push_bind(serde_json::to_string(&filter.value)?);
            qb.push(", '$')");
        }

        match order_by {
            Some(order) => {
                qb.push(" ORDER BY json_extract(data, ");
                qb.push_bind(json_path(&order.field));
                qb.push(format!(") {dir}, seq {dir}", dir = order.direction));
            }
            None => {
                qb.push(" ORDER BY seq ASC");
            }
        }

        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await?;

        debug!(
            collection = collection,
            filters = filters.len(),
            returned = rows.len(),
            "Document query"
        );

        rows.into_iter().map(Document::try_from).collect()
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert(&self, collection: &str, record: Value) -> Result<String, StoreError> {
        ensure_object(&record)?;
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO documents (collection, id, revision, data) VALUES ($1, $2, 1, $3)")
            .bind(collection)
            .bind(&id)
            .bind(serde_json::to_string(&record)?)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, revision, data FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Document::try_from).transpose()
    }

    async fn query_top_n(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.select(collection, filters, order_by, Some(limit)).await
    }

    async fn query_all(
        &self,
        collection: &str,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
    ) -> Result<Vec<Document>, StoreError> {
        self.select(collection, filters, order_by, None).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected_revision: Option<i64>,
        record: Value,
    ) -> Result<bool, StoreError> {
        ensure_object(&record)?;
        let data = serde_json::to_string(&record)?;

        let result = match expected_revision {
            None => {
                sqlx::query(
                    r#"INSERT INTO documents (collection, id, revision, data)
                    VALUES ($1, $2, 1, $3)
                    ON CONFLICT(collection, id) DO NOTHING"#,
                )
                .bind(collection)
                .bind(id)
                .bind(data)
                .execute(&self.pool)
                .await?
            }
            Some(revision) => {
                sqlx::query(
                    r#"UPDATE documents
                    SET data = $1, revision = revision + 1
                    WHERE collection = $2 AND id = $3 AND revision = $4"#,
                )
                .bind(data)
                .bind(collection)
                .bind(id)
                .bind(revision)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}
