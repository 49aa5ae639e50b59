//! PostgreSQL-backed document store.
//!
//! Documents are JSONB rows scoped by `(tenant_id, collection)`. Equality
//! conditions of filters and of a pipeline's leading `$match` are pushed
//! down as a `@>` containment prefilter; the full filter and query
//! pipelines are then evaluated with the shared document semantics so this
//! store behaves exactly like the in-memory one. A unique expression index
//! on `body->>'id'` backs id uniqueness per collection.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use execustack_tasks::stack::document::{apply_update, matches, run_pipeline, seed_from_filter};
use execustack_tasks::stack::DocumentStore;
use execustack_tasks::StackError;

use super::{stack_error, DbPool};

/// Document store over the `es_documents` table.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: DbPool,
}

impl PgDocumentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Rows of a collection passing the containment prefilter, oldest first.
    async fn candidates(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Vec<(i64, Value)>, StackError> {
        let rows: Vec<(i64, Json<Value>)> = sqlx::query_as(
            r#"
            SELECT row_id, body FROM es_documents
            WHERE tenant_id = $1 AND collection = $2 AND body @> $3
            ORDER BY row_id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(collection)
        .bind(Json(containment_filter(filter)))
        .fetch_all(&mut **tx)
        .await
        .map_err(stack_error(StackError::Store))?;

        Ok(rows.into_iter().map(|(id, body)| (id, body.0)).collect())
    }

    /// First row fully matching `filter`.
    async fn first_match(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<(i64, Value)>, StackError> {
        for (row_id, body) in self.candidates(tx, tenant_id, collection, filter).await? {
            if matches(&body, filter)? {
                return Ok(Some((row_id, body)));
            }
        }
        Ok(None)
    }

    /// Write `document` over `row_id`, or insert it when there is no row.
    async fn write(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        collection: &str,
        row_id: Option<i64>,
        document: &Value,
    ) -> Result<(), StackError> {
        let query = match row_id {
            Some(row_id) => sqlx::query("UPDATE es_documents SET body = $1 WHERE row_id = $2")
                .bind(Json(document))
                .bind(row_id),
            None => sqlx::query(
                "INSERT INTO es_documents (tenant_id, collection, body) VALUES ($2, $3, $1)",
            )
            .bind(Json(document))
            .bind(tenant_id)
            .bind(collection),
        };
        query.execute(&mut **tx).await.map_err(write_error)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StackError> {
        self.pool.begin().await.map_err(stack_error(StackError::Store))
    }
}

/// Equality conditions on plain top-level fields, as a containment document.
///
/// Operator conditions and dotted paths are left to in-memory matching.
pub fn containment_filter(filter: &Value) -> Value {
    let mut contained = Map::new();
    if let Value::Object(conditions) = filter {
        for (path, condition) in conditions {
            let is_operator = condition
                .as_object()
                .map(|m| m.keys().any(|k| k.starts_with('$')))
                .unwrap_or(false);
            if !is_operator && !path.contains('.') && !path.starts_with('$') {
                contained.insert(path.clone(), condition.clone());
            }
        }
    }
    Value::Object(contained)
}

/// Containment prefilter for a pipeline, taken from its leading `$match`.
pub fn leading_match_filter(pipeline: &[Value]) -> Value {
    pipeline
        .first()
        .and_then(|stage| stage.get("$match"))
        .map(containment_filter)
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Unique violations become `Duplicate`, everything else `Store`.
fn write_error(e: sqlx::Error) -> StackError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => StackError::Duplicate(db.message().to_string()),
        _ => StackError::Store(e.to_string()),
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, StackError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StackError::Store(format!("document must be an object, got {}", other))),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find_one(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, StackError> {
        let mut tx = self.begin().await?;
        let found = self.first_match(&mut tx, tenant_id, collection, filter).await?;
        tx.commit().await.map_err(stack_error(StackError::Store))?;
        Ok(found.map(|(_, body)| body))
    }

    async fn query(
        &self,
        tenant_id: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Value>, StackError> {
        let rows: Vec<(Json<Value>,)> = sqlx::query_as(
            r#"
            SELECT body FROM es_documents
            WHERE tenant_id = $1 AND collection = $2 AND body @> $3
            ORDER BY row_id
            "#,
        )
        .bind(tenant_id)
        .bind(collection)
        .bind(Json(leading_match_filter(pipeline)))
        .fetch_all(&self.pool)
        .await
        .map_err(stack_error(StackError::Store))?;

        run_pipeline(rows.into_iter().map(|(body,)| body.0).collect(), pipeline)
    }

    async fn upsert(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
        fields: Value,
    ) -> Result<Value, StackError> {
        let mut tx = self.begin().await?;
        let existing = self.first_match(&mut tx, tenant_id, collection, filter).await?;

        let (row_id, mut document) = match existing {
            Some((row_id, body)) => (Some(row_id), into_object(body)?),
            None => (None, seed_from_filter(filter)),
        };
        apply_update(&mut document, &fields)?;
        let document = Value::Object(document);

        self.write(&mut tx, tenant_id, collection, row_id, &document).await?;
        tx.commit().await.map_err(stack_error(StackError::Store))?;
        Ok(document)
    }

    async fn replace(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
        document: Value,
    ) -> Result<Value, StackError> {
        let mut replacement = seed_from_filter(filter);
        replacement.extend(into_object(document)?);
        let replacement = Value::Object(replacement);

        let mut tx = self.begin().await?;
        let row_id = self
            .first_match(&mut tx, tenant_id, collection, filter)
            .await?
            .map(|(row_id, _)| row_id);
        self.write(&mut tx, tenant_id, collection, row_id, &replacement).await?;
        tx.commit().await.map_err(stack_error(StackError::Store))?;
        Ok(replacement)
    }

    async fn delete_one(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<bool, StackError> {
        let mut tx = self.begin().await?;
        let Some((row_id, _)) = self.first_match(&mut tx, tenant_id, collection, filter).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM es_documents WHERE row_id = $1")
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(stack_error(StackError::Store))?;
        tx.commit().await.map_err(stack_error(StackError::Store))?;
        Ok(true)
    }
}
