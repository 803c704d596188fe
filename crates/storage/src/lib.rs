use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use fitness_core::types::{Recommendation, UserId};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the recommendation store.
    pub fn recommendations(&self) -> RecommendationRepository {
        RecommendationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the durable activity queue.
    pub fn activity_queue(&self) -> ActivityQueueRepository {
        ActivityQueueRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository storing one recommendation per activity.
#[derive(Clone)]
pub struct RecommendationRepository {
    pool: SqlitePool,
}

impl RecommendationRepository {
    /// Stores a recommendation unless one already exists for the same activity.
    ///
    /// The first write wins; later writes for the same `activity_id` leave the
    /// row untouched and report [`PersistOutcome::AlreadyPresent`].
    pub async fn persist(
        &self,
        recommendation: &Recommendation,
        persisted_at: DateTime<Utc>,
    ) -> Result<PersistOutcome, RecommendationError> {
        let improvements = serde_json::to_string(&recommendation.improvements)?;
        let suggestions = serde_json::to_string(&recommendation.suggestions)?;
        let safety = serde_json::to_string(&recommendation.safety)?;

        let result = sqlx::query(
            "INSERT INTO recommendations \
             (activity_id, id, user_id, activity_type, content, improvements_json, suggestions_json, safety_json, generated_at, persisted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(activity_id) DO NOTHING",
        )
        .bind(&recommendation.activity_id)
        .bind(&recommendation.id)
        .bind(recommendation.user_id.as_str())
        .bind(&recommendation.activity_type)
        .bind(&recommendation.content)
        .bind(improvements)
        .bind(suggestions)
        .bind(safety)
        .bind(to_rfc3339(recommendation.generated_at))
        .bind(to_rfc3339(persisted_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(PersistOutcome::AlreadyPresent)
        } else {
            Ok(PersistOutcome::Inserted)
        }
    }

    /// Loads the recommendation generated for an activity.
    pub async fn fetch_by_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<Recommendation>, RecommendationError> {
        let row = sqlx::query(
            "SELECT activity_id, id, user_id, activity_type, content, improvements_json, suggestions_json, safety_json, generated_at \
             FROM recommendations WHERE activity_id = ?",
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_recommendation(&row)).transpose()
    }

    /// Lists recommendations for a user, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Recommendation>, RecommendationError> {
        let rows = sqlx::query(
            "SELECT activity_id, id, user_id, activity_type, content, improvements_json, suggestions_json, safety_json, generated_at \
             FROM recommendations WHERE user_id = ? ORDER BY generated_at DESC, activity_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_recommendation).collect()
    }
}

fn decode_recommendation(row: &sqlx::sqlite::SqliteRow) -> Result<Recommendation, RecommendationError> {
    let user_id: String = row.try_get("user_id")?;
    let improvements: String = row.try_get("improvements_json")?;
    let suggestions: String = row.try_get("suggestions_json")?;
    let safety: String = row.try_get("safety_json")?;

    Ok(Recommendation {
        id: row.try_get("id")?,
        activity_id: row.try_get("activity_id")?,
        user_id: UserId::parse(user_id).map_err(|_| RecommendationError::CorruptRow("user_id"))?,
        activity_type: row.try_get("activity_type")?,
        content: row.try_get("content")?,
        improvements: serde_json::from_str(&improvements)?,
        suggestions: serde_json::from_str(&suggestions)?,
        safety: serde_json::from_str(&safety)?,
        generated_at: row.try_get("generated_at")?,
    })
}

/// Result of attempting to persist a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    AlreadyPresent,
}

impl PersistOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::AlreadyPresent => "already_present",
        }
    }
}

/// Errors raised by the recommendation repository.
#[derive(Debug, Error)]
pub enum RecommendationError {
    #[error("failed to encode or decode recommendation json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored recommendation has an invalid {0}")]
    CorruptRow(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RecommendationError {
    /// Database failures may clear up on retry; encoding problems will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Repository backing the durable activity channel.
///
/// A message is leased by bumping its `attempts` counter and pushing
/// `visible_at` into the future. The attempt count doubles as the lease token:
/// ack, release and dead-letter only apply while it still matches, so a worker
/// whose lease expired cannot disturb the worker that re-leased the message.
#[derive(Clone)]
pub struct ActivityQueueRepository {
    pool: SqlitePool,
}

impl ActivityQueueRepository {
    /// Appends a message to `queue`. Re-publishing an existing message id is ignored.
    pub async fn publish(
        &self,
        queue: &str,
        message_id: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, QueueError> {
        let now = to_rfc3339(now);
        let result = sqlx::query(
            "INSERT INTO activity_queue (message_id, queue, payload, attempts, enqueued_at, visible_at) \
             VALUES (?, ?, ?, 0, ?, ?) \
             ON CONFLICT(queue, message_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(queue)
        .bind(payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(PublishOutcome::Duplicate)
        } else {
            Ok(PublishOutcome::Enqueued)
        }
    }

    /// Claims the oldest visible message of `queue` until `visible_until`.
    pub async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        let row = sqlx::query(
            "UPDATE activity_queue \
                SET attempts = attempts + 1, \
                    visible_at = ? \
              WHERE seq = ( \
                    SELECT seq FROM activity_queue \
                     WHERE queue = ? AND visible_at <= ? \
                     ORDER BY seq \
                     LIMIT 1) \
             RETURNING queue, message_id, payload, attempts",
        )
        .bind(to_rfc3339(visible_until))
        .bind(queue)
        .bind(to_rfc3339(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempts: i64 = row.try_get("attempts")?;
        Ok(Some(LeasedMessage {
            queue: row.try_get("queue")?,
            message_id: row.try_get("message_id")?,
            payload: row.try_get("payload")?,
            attempts: attempts as u32,
        }))
    }

    /// Removes a processed message. Returns `false` when the lease was lost.
    pub async fn ack(&self, message: &LeasedMessage) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "DELETE FROM activity_queue WHERE queue = ? AND message_id = ? AND attempts = ?",
        )
        .bind(&message.queue)
        .bind(&message.message_id)
        .bind(i64::from(message.attempts))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Makes a leased message visible again at `visible_at`.
    pub async fn release(
        &self,
        message: &LeasedMessage,
        visible_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE activity_queue SET visible_at = ? \
             WHERE queue = ? AND message_id = ? AND attempts = ?",
        )
        .bind(to_rfc3339(visible_at))
        .bind(&message.queue)
        .bind(&message.message_id)
        .bind(i64::from(message.attempts))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves a leased message to `activity_dead_letters` in one transaction.
    pub async fn dead_letter(
        &self,
        message: &LeasedMessage,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "INSERT OR REPLACE INTO activity_dead_letters \
             (message_id, queue, payload, attempts, reason, enqueued_at, dead_lettered_at) \
             SELECT message_id, queue, payload, attempts, ?, enqueued_at, ? \
               FROM activity_queue \
              WHERE queue = ? AND message_id = ? AND attempts = ?",
        )
        .bind(reason)
        .bind(to_rfc3339(now))
        .bind(&message.queue)
        .bind(&message.message_id)
        .bind(i64::from(message.attempts))
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "DELETE FROM activity_queue WHERE queue = ? AND message_id = ? AND attempts = ?",
        )
        .bind(&message.queue)
        .bind(&message.message_id)
        .bind(i64::from(message.attempts))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Number of messages still on `queue`, leased or not.
    pub async fn pending_count(&self, queue: &str) -> Result<u64, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM activity_queue WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        let pending: i64 = row.try_get("pending")?;
        Ok(pending as u64)
    }

    /// Lists dead-lettered messages of `queue` in the order they were moved.
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT message_id, payload, attempts, reason FROM activity_dead_letters \
             WHERE queue = ? ORDER BY dead_lettered_at, message_id",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Result of publishing onto the activity queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued,
    Duplicate,
}

/// A message claimed by one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedMessage {
    pub queue: String,
    pub message_id: String,
    pub payload: String,
    /// Delivery count including this one.
    pub attempts: u32,
}

/// Dead-lettered message row.
#[derive(Debug, sqlx::FromRow)]
pub struct DeadLetter {
    pub message_id: String,
    pub payload: String,
    pub attempts: i64,
    pub reason: String,
}

/// Errors raised by the activity queue repository.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
