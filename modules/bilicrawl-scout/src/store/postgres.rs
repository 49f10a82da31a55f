// Postgres persistence for commenter records and the content catalog.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use bilicrawl_common::{CommenterRecord, ContentItem};

use crate::error::CrawlError;
use crate::traits::HarvestStore;

pub struct PgHarvestStore {
    pool: PgPool,
}

impl PgHarvestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> crate::error::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("Connected to Postgres harvest store");
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> crate::error::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CrawlError::Database(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl HarvestStore for PgHarvestStore {
    async fn commenter_exists(&self, uid: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM commenters WHERE uid = $1)",
        )
        .bind(uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_commenter_if_absent(&self, record: &CommenterRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO commenters
                (uid, nickname, level, comment, label, content_id, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (uid) DO NOTHING
            "#,
        )
        .bind(&record.uid)
        .bind(&record.nickname)
        .bind(&record.level)
        .bind(&record.comment)
        .bind(record.label)
        .bind(&record.content_id)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove_duplicate_commenters(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM commenters a
            USING commenters b
            WHERE a.uid = b.uid
              AND (a.observed_at, a.id) > (b.observed_at, b.id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO content_items (id, title, label)
                VALUES ($1, $2, FALSE)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&item.id)
            .bind(item.display_title())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
