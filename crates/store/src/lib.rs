//! Postgres persistence for Confab.
//!
//! One [`Store`] wraps a `PgPool` plus an optional tenant schema. Every
//! operation runs inside a transaction; when a schema is set, the
//! transaction starts with `SET LOCAL search_path` so all statements hit
//! that tenant's tables. Multi-row writes (message dual-writes, batch
//! enqueues) commit atomically.

pub mod documents;
pub mod graph;
pub mod messages;
pub mod queue;
pub mod schema;
pub mod threads;
pub mod users;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use cf_domain::error::{Error, Result};

/// Embedding dimensionality fixed by the migrations (`vector(1536)`).
pub const EMBEDDING_DIM: usize = 1536;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    /// Tenant schema; `None` = default search path.
    schema: Option<String>,
}

impl Store {
    /// Connect to Postgres and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(db)?;
        let store = Self { pool, schema: None };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool (no migration run).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, schema: None }
    }

    /// A view of this store scoped to a tenant schema. Queries through
    /// the view run with `search_path = "<schema>", public`.
    pub fn with_schema(&self, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        schema::validate_ident(&schema)?;
        Ok(Self {
            pool: self.pool.clone(),
            schema: Some(schema),
        })
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply migrations to the default schema.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.map_err(|e| {
            Error::Database(format!("migration failed: {e}"))
        })
    }

    /// Begin a transaction with the tenant search path applied.
    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        if let Some(schema) = &self.schema {
            let stmt = format!(r#"SET LOCAL search_path TO "{schema}", public"#);
            sqlx::query(&stmt).execute(&mut *tx).await.map_err(db)?;
        }
        Ok(tx)
    }

    pub(crate) fn migrator() -> &'static sqlx::migrate::Migrator {
        &MIGRATOR
    }
}

/// Map a sqlx error into the shared taxonomy: contention and transport
/// failures are transient, the rest is infrastructure.
pub(crate) fn db(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(dbe) => match dbe.code().as_deref() {
            // serialization_failure / deadlock_detected
            Some("40001") | Some("40P01") => Error::Transport(format!("database contention: {dbe}")),
            _ => Error::Database(e.to_string()),
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => Error::Transport(e.to_string()),
        _ => Error::Database(e.to_string()),
    }
}

/// Unique-violation check for idempotent inserts that swallow conflicts.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(dbe) if dbe.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_validated() {
        let pool_less = |schema: &str| schema::validate_ident(schema);
        assert!(pool_less("tenant_a").is_ok());
        assert!(pool_less("Tenant9").is_ok());
        assert!(pool_less("bad-name").is_err());
        assert!(pool_less("1leading").is_err());
        assert!(pool_less("drop\"; --").is_err());
        assert!(pool_less("").is_err());
    }
}
