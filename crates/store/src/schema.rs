//! Optional per-tenant schema isolation.
//!
//! A tenant schema is a full copy of the core tables reached through
//! `search_path`. Provisioning is idempotent: `CREATE SCHEMA IF NOT
//! EXISTS` plus the embedded migrations, tracked per schema.

use sqlx::Connection;

use cf_domain::error::{Error, Result};

use crate::{db, Store};

/// Reject anything that is not a plain SQL identifier; schema names are
/// interpolated into `SET search_path` and `CREATE SCHEMA`.
pub fn validate_ident(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid schema name {name:?}: expected [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

impl Store {
    /// Create the schema if missing and bring it up to date with the
    /// embedded migrations. Safe to call on every run.
    pub async fn ensure_schema(&self, schema: &str) -> Result<()> {
        validate_ident(schema)?;

        let mut conn = self.pool().acquire().await.map_err(db)?;
        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{schema}""#))
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        sqlx::query(&format!(r#"SET search_path TO "{schema}", public"#))
            .execute(&mut *conn)
            .await
            .map_err(db)?;

        let result = Store::migrator().run(&mut *conn).await;

        // The connection returns to the pool; put its search path back.
        let reset = sqlx::query("SET search_path TO public")
            .execute(&mut *conn)
            .await;
        if reset.is_err() {
            // A broken connection cannot be reset; close it instead of
            // leaking a tenant search path into the pool.
            let _ = conn.detach().close().await;
        }

        result.map_err(|e| Error::Database(format!("schema migration failed: {e}")))
    }
}
