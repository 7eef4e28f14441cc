use std::path::Path;
use std::time::Duration;

use sea_orm::sea_query::{Expr, ExprTrait, OnConflict};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, Schema,
};
use time::OffsetDateTime;
use tracing::debug;

use crate::entities;
use crate::entities::failures::{ActiveModel, Column};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    General,
    RateLimit,
    Cleared,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::General => "general",
            FailureClass::RateLimit => "rate_limit",
            FailureClass::Cleared => "cleared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub model: String,
    pub failed_at: i64,
    pub failure_type: String,
    pub failure_count: i32,
}

impl From<entities::failures::Model> for FailureRecord {
    fn from(row: entities::failures::Model) -> Self {
        Self {
            model: row.model,
            failed_at: row.failed_at,
            failure_type: row.failure_type,
            failure_count: row.failure_count,
        }
    }
}

/// Durable cooldown ledger for models that recently failed. Owns its SQLite
/// file; all request handlers share one instance.
#[derive(Clone)]
pub struct FailureStore {
    db: DatabaseConnection,
    default_cooldown: Duration,
    rate_limit_cooldown: Duration,
}

impl FailureStore {
    pub async fn open(
        path: &Path,
        default_cooldown: Duration,
        rate_limit_cooldown: Duration,
    ) -> StorageResult<Self> {
        let dsn = format!("sqlite://{}?mode=rwc", path.display());
        Self::connect(&dsn, default_cooldown, rate_limit_cooldown).await
    }

    pub async fn connect(
        dsn: &str,
        default_cooldown: Duration,
        rate_limit_cooldown: Duration,
    ) -> StorageResult<Self> {
        // One pooled connection: SQLite serializes writers anyway, and a
        // single handle keeps `sqlite::memory:` databases coherent.
        let mut options = ConnectOptions::new(dsn.to_string());
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await?;

        let backend = db.get_database_backend();
        let mut create = Schema::new(backend).create_table_from_entity(entities::Failures);
        create.if_not_exists();
        db.execute(backend.build(&create)).await?;

        Ok(Self {
            db,
            default_cooldown,
            rate_limit_cooldown,
        })
    }

    pub async fn mark(&self, model: &str) -> StorageResult<()> {
        self.mark_with_class(model, FailureClass::General).await
    }

    /// Upsert: the timestamp and class reflect the newest failure while the
    /// count keeps growing across reclassifications.
    pub async fn mark_with_class(&self, model: &str, class: FailureClass) -> StorageResult<()> {
        let row = ActiveModel {
            model: Set(model.to_string()),
            failed_at: Set(OffsetDateTime::now_utc().unix_timestamp()),
            failure_type: Set(class.as_str().to_string()),
            failure_count: Set(1),
        };
        entities::Failures::insert(row)
            .on_conflict(
                OnConflict::column(Column::Model)
                    .update_columns([Column::FailedAt, Column::FailureType])
                    .value(Column::FailureCount, Expr::col(Column::FailureCount).add(1))
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        debug!(model, class = class.as_str(), "failure recorded");
        Ok(())
    }

    pub async fn should_skip(&self, model: &str) -> StorageResult<bool> {
        let Some(row) = entities::Failures::find_by_id(model).one(&self.db).await? else {
            return Ok(false);
        };
        Ok(suppressed(
            &row,
            OffsetDateTime::now_utc().unix_timestamp(),
            self.default_cooldown,
            self.rate_limit_cooldown,
        ))
    }

    pub async fn get(&self, model: &str) -> StorageResult<Option<FailureRecord>> {
        Ok(entities::Failures::find_by_id(model)
            .one(&self.db)
            .await?
            .map(FailureRecord::from))
    }

    /// Reset the row instead of deleting it so the failure history stays
    /// visible for diagnostics.
    pub async fn clear(&self, model: &str) -> StorageResult<()> {
        entities::Failures::update_many()
            .col_expr(Column::FailureCount, Expr::value(0))
            .col_expr(Column::FailureType, Expr::value(FailureClass::Cleared.as_str()))
            .filter(Column::Model.eq(model))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn reset_all(&self) -> StorageResult<()> {
        entities::Failures::delete_many().exec(&self.db).await?;
        Ok(())
    }

    pub async fn close(self) -> StorageResult<()> {
        self.db.close().await?;
        Ok(())
    }
}

/// Cooldown policy: rate-limited models sit out a fixed window; anything else
/// waits the base cooldown scaled by the failure count, capped at 5x. A
/// cleared row never suppresses, whatever its timestamp says.
fn suppressed(
    row: &entities::failures::Model,
    now_unix: i64,
    default_cooldown: Duration,
    rate_limit_cooldown: Duration,
) -> bool {
    if row.failure_type == FailureClass::Cleared.as_str() {
        return false;
    }
    let cooldown = if row.failure_type == FailureClass::RateLimit.as_str() {
        rate_limit_cooldown
    } else if row.failure_count > 1 {
        default_cooldown * row.failure_count.min(5) as u32
    } else {
        default_cooldown
    };
    let elapsed = now_unix.saturating_sub(row.failed_at).max(0) as u64;
    elapsed < cooldown.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: Duration = Duration::from_secs(300);
    const RATE_LIMIT: Duration = Duration::from_secs(60);

    fn row(failure_type: &str, failure_count: i32, failed_at: i64) -> entities::failures::Model {
        entities::failures::Model {
            model: "v/m:free".to_string(),
            failed_at,
            failure_type: failure_type.to_string(),
            failure_count,
        }
    }

    #[test]
    fn general_cooldown_window() {
        let r = row("general", 1, 1_000);
        assert!(suppressed(&r, 1_000 + 299, DEFAULT, RATE_LIMIT));
        assert!(!suppressed(&r, 1_000 + 300, DEFAULT, RATE_LIMIT));
    }

    #[test]
    fn rate_limit_uses_fixed_window() {
        let r = row("rate_limit", 7, 1_000);
        assert!(suppressed(&r, 1_000 + 59, DEFAULT, RATE_LIMIT));
        assert!(!suppressed(&r, 1_000 + 60, DEFAULT, RATE_LIMIT));
    }

    #[test]
    fn repeated_failures_scale_the_window() {
        let r = row("general", 2, 1_000);
        assert!(suppressed(&r, 1_000 + 599, DEFAULT, RATE_LIMIT));
        assert!(!suppressed(&r, 1_000 + 600, DEFAULT, RATE_LIMIT));
    }

    #[test]
    fn multiplier_saturates_at_five() {
        let five = row("general", 5, 1_000);
        let fifty = row("general", 50, 1_000);
        assert!(!suppressed(&five, 1_000 + 1_500, DEFAULT, RATE_LIMIT));
        assert!(!suppressed(&fifty, 1_000 + 1_500, DEFAULT, RATE_LIMIT));
        assert!(suppressed(&fifty, 1_000 + 1_499, DEFAULT, RATE_LIMIT));
    }

    #[test]
    fn cleared_rows_never_suppress() {
        let r = row("cleared", 0, i64::MAX - 1);
        assert!(!suppressed(&r, 0, DEFAULT, RATE_LIMIT));
    }

    async fn memory_store() -> FailureStore {
        FailureStore::connect("sqlite::memory:", DEFAULT, RATE_LIMIT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn mark_then_skip_then_clear() {
        let store = memory_store().await;
        assert!(!store.should_skip("v/m:free").await.unwrap());

        store.mark("v/m:free").await.unwrap();
        assert!(store.should_skip("v/m:free").await.unwrap());

        store.clear("v/m:free").await.unwrap();
        assert!(!store.should_skip("v/m:free").await.unwrap());

        // The row survives a clear for history.
        let record = store.get("v/m:free").await.unwrap().unwrap();
        assert_eq!(record.failure_type, "cleared");
        assert_eq!(record.failure_count, 0);
    }

    #[tokio::test]
    async fn upsert_increments_count_and_reclassifies() {
        let store = memory_store().await;
        store.mark("v/m:free").await.unwrap();
        store
            .mark_with_class("v/m:free", FailureClass::RateLimit)
            .await
            .unwrap();

        let record = store.get("v/m:free").await.unwrap().unwrap();
        assert_eq!(record.failure_count, 2);
        assert_eq!(record.failure_type, "rate_limit");
    }

    #[tokio::test]
    async fn reset_all_deletes_every_row() {
        let store = memory_store().await;
        store.mark("a/x").await.unwrap();
        store.mark("b/y").await.unwrap();
        store.reset_all().await.unwrap();
        assert!(store.get("a/x").await.unwrap().is_none());
        assert!(store.get("b/y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_model_is_not_skipped() {
        let store = memory_store().await;
        assert!(!store.should_skip("never/seen").await.unwrap());
    }
}
