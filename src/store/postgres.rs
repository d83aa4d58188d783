use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{KvEntry, KvStore, StoreError};

/// Postgres-backed [`KvStore`].
///
/// Every key is one row; `dir` and `seq` are derived columns so directory
/// listings and ordered creates stay index-backed. Ordered creation relies on
/// the primary key: compute `max(seq) + 1`, insert, retry on collision.
pub struct PgKv {
    pool: PgPool,
}

impl PgKv {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(url), err)]
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        tracing::info!("connected to postgres");

        sqlx::migrate!().run(&pool).await?;
        tracing::info!("migrations applied");

        Ok(Self { pool })
    }
}

fn split_key(key: &str) -> (String, String) {
    match key.rsplit_once('/') {
        Some((dir, name)) => (dir.to_owned(), name.to_owned()),
        None => (String::new(), key.to_owned()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl KvStore for PgKv {
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let (dir, name) = split_key(key);
        let seq: Option<i64> = name.parse().ok();
        let result = sqlx::query(
            "INSERT INTO kv_entries (path, dir, name, seq, value) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(key)
        .bind(&dir)
        .bind(&name)
        .bind(seq)
        .bind(&value)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists(key.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_in_directory(&self, dir: &str, value: Vec<u8>) -> Result<String, StoreError> {
        loop {
            let row = sqlx::query(
                r#"
                INSERT INTO kv_entries (path, dir, name, seq, value)
                SELECT $1 || '/' || next.n::text, $1, next.n::text, next.n, $2
                FROM (SELECT COALESCE(MAX(seq), 0) + 1 AS n FROM kv_entries WHERE dir = $1) next
                ON CONFLICT (path) DO NOTHING
                RETURNING path
                "#,
            )
            .bind(dir)
            .bind(&value)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?;

            // None means another writer claimed the number first; recompute.
            if let Some(row) = row {
                return Ok(row.get::<String, _>("path"));
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE path = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        row.map(|r| r.get::<Vec<u8>, _>("value"))
            .ok_or_else(|| StoreError::NotFound(key.to_owned()))
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE kv_entries SET value = $2, updated_at = now() WHERE path = $1")
                .bind(key)
                .bind(&value)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_owned()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE path = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_owned()));
        }
        Ok(())
    }

    async fn delete_subtree(&self, prefix: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE path = $1 OR path LIKE $1 || '/%'")
            .bind(prefix)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

    async fn list_directory(&self, dir: &str) -> Result<Vec<KvEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT path, value FROM kv_entries WHERE dir = $1 ORDER BY seq NULLS LAST, name",
        )
        .bind(dir)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| KvEntry {
                key: r.get("path"),
                value: r.get("value"),
            })
            .collect())
    }
}
