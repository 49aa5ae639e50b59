//! Table definitions, applied idempotently at startup.

use super::DbPool;

/// Statements creating every table the adapters use.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS es_documents (
        row_id BIGSERIAL PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        body JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS es_documents_scope_idx ON es_documents (tenant_id, collection)",
    "CREATE INDEX IF NOT EXISTS es_documents_body_idx ON es_documents USING GIN (body jsonb_path_ops)",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS es_documents_id_uniq
        ON es_documents (tenant_id, collection, (body->>'id'))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS es_cache (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS es_locks (
        key TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Create missing tables and indexes.
pub async fn migrate(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = SCHEMA.len(), "Database schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "{}", statement);
        }
    }

    #[test]
    fn test_document_ids_are_unique_per_collection() {
        let index = SCHEMA
            .iter()
            .find(|s| s.contains("es_documents_id_uniq"))
            .expect("unique id index");
        assert!(index.contains("UNIQUE INDEX"));
        assert!(index.contains("(tenant_id, collection, (body->>'id'))"));
    }
}
