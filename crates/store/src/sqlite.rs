//! SQLite backend.
//!
//! Uniqueness guarantees the engine relies on are enforced by the schema:
//! - `uq_enrollments_active`: one ACTIVE enrollment per `(user_id, sequence_id)`
//! - `uq_deliveries_outcome`: one success and one permanent failure per
//!   `(subject, unit_key)`; a permanent failure is never written after a success
//! - `delivery_claims`: one live send lease per `(subject, unit_key)`
//!
//! Compare-and-swap updates are single `UPDATE ... WHERE` statements, so
//! several processes may share one database file.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use coachflow_core::delivery::{DeliveryOutcome, DeliveryRecord, DeliverySubject, NewDelivery};
use coachflow_core::enrollment::{Enrollment, EnrollmentStatus, EnrollmentUpdate, NewEnrollment};
use coachflow_core::error::StoreError;
use coachflow_core::rule::{RuleTrigger, WorkflowRule};
use coachflow_core::sequence::Sequence;
use coachflow_core::store::{CreateOutcome, RecordOutcome, Store, UpdateOutcome};
use coachflow_core::tag::{Tag, TagSet};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::check_update;

/// Attempts at `create_enrollment` when the insert loses to a row that is
/// exited before it can be read back.
const CREATE_ATTEMPTS: usize = 3;

/// A SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to ":memory:" is its own database
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements: &[(&str, &str)] = &[
            (
                "sequences table",
                r#"
                CREATE TABLE IF NOT EXISTS sequences (
                    id           TEXT PRIMARY KEY,
                    name         TEXT NOT NULL,
                    active       INTEGER NOT NULL DEFAULT 1,
                    trigger_tag  TEXT,
                    exit_tag     TEXT,
                    steps        TEXT NOT NULL DEFAULT '[]'
                )
                "#,
            ),
            (
                "sequences trigger_tag index",
                "CREATE INDEX IF NOT EXISTS idx_sequences_trigger_tag ON sequences(trigger_tag)",
            ),
            (
                "enrollments table",
                r#"
                CREATE TABLE IF NOT EXISTS enrollments (
                    id              TEXT PRIMARY KEY,
                    user_id         TEXT NOT NULL,
                    sequence_id     TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    current_step    INTEGER NOT NULL DEFAULT 0,
                    next_due_at     TEXT,
                    steps_delivered INTEGER NOT NULL DEFAULT 0,
                    enrolled_at     TEXT NOT NULL,
                    completed_at    TEXT,
                    exited_at       TEXT,
                    exit_reason     TEXT,
                    needs_review    INTEGER NOT NULL DEFAULT 0,
                    lease_until     TEXT
                )
                "#,
            ),
            (
                "active enrollment unique index",
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS uq_enrollments_active
                ON enrollments(user_id, sequence_id) WHERE status = 'active'
                "#,
            ),
            (
                "enrollments due index",
                "CREATE INDEX IF NOT EXISTS idx_enrollments_due ON enrollments(status, next_due_at)",
            ),
            (
                "enrollments user index",
                "CREATE INDEX IF NOT EXISTS idx_enrollments_user ON enrollments(user_id)",
            ),
            (
                "tags table",
                r#"
                CREATE TABLE IF NOT EXISTS tags (
                    user_id     TEXT NOT NULL,
                    tag_key     TEXT NOT NULL,
                    tag_value   TEXT,
                    metadata    TEXT,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL,
                    PRIMARY KEY (user_id, tag_key)
                )
                "#,
            ),
            (
                "deliveries table",
                r#"
                CREATE TABLE IF NOT EXISTS deliveries (
                    id           TEXT PRIMARY KEY,
                    subject      TEXT NOT NULL,
                    unit_key     TEXT NOT NULL,
                    outcome      TEXT NOT NULL,
                    detail       TEXT,
                    recorded_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "drop single-terminal delivery index",
                "DROP INDEX IF EXISTS uq_deliveries_terminal",
            ),
            (
                "terminal delivery unique index",
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS uq_deliveries_outcome
                ON deliveries(subject, unit_key, outcome) WHERE outcome != 'transient_failure'
                "#,
            ),
            (
                "delivery claims table",
                r#"
                CREATE TABLE IF NOT EXISTS delivery_claims (
                    subject      TEXT NOT NULL,
                    unit_key     TEXT NOT NULL,
                    lease_until  TEXT NOT NULL,
                    PRIMARY KEY (subject, unit_key)
                )
                "#,
            ),
            (
                "deliveries subject index",
                "CREATE INDEX IF NOT EXISTS idx_deliveries_subject ON deliveries(subject, recorded_at)",
            ),
            (
                "rules table",
                r#"
                CREATE TABLE IF NOT EXISTS rules (
                    id            TEXT PRIMARY KEY,
                    name          TEXT NOT NULL,
                    trigger_spec  TEXT NOT NULL,
                    trigger_kind  TEXT NOT NULL,
                    conditions    TEXT NOT NULL DEFAULT '[]',
                    actions       TEXT NOT NULL DEFAULT '[]',
                    active        INTEGER NOT NULL DEFAULT 1
                )
                "#,
            ),
            (
                "rules trigger index",
                "CREATE INDEX IF NOT EXISTS idx_rules_trigger ON rules(trigger_kind, trigger_spec)",
            ),
            (
                "activity table",
                r#"
                CREATE TABLE IF NOT EXISTS activity (
                    user_id         TEXT PRIMARY KEY,
                    last_active_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "activity index",
                "CREATE INDEX IF NOT EXISTS idx_activity_last ON activity(last_active_at)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_enrollment(row: &SqliteRow) -> Result<Enrollment, StoreError> {
        let status: String = col(row, "status")?;
        let status = EnrollmentStatus::from_str(&status).map_err(StoreError::QueryFailed)?;
        let enrolled_at: String = col(row, "enrolled_at")?;

        Ok(Enrollment {
            id: col(row, "id")?,
            user_id: col(row, "user_id")?,
            sequence_id: col(row, "sequence_id")?,
            status,
            current_step: to_u32(col(row, "current_step")?, "current_step")?,
            next_due_at: opt_ts(col(row, "next_due_at")?, "next_due_at")?,
            steps_delivered: to_u32(col(row, "steps_delivered")?, "steps_delivered")?,
            enrolled_at: parse_ts(&enrolled_at, "enrolled_at")?,
            completed_at: opt_ts(col(row, "completed_at")?, "completed_at")?,
            exited_at: opt_ts(col(row, "exited_at")?, "exited_at")?,
            exit_reason: col(row, "exit_reason")?,
            needs_review: col(row, "needs_review")?,
            lease_until: opt_ts(col(row, "lease_until")?, "lease_until")?,
        })
    }

    fn row_to_tag(row: &SqliteRow) -> Result<Tag, StoreError> {
        let metadata: Option<String> = col(row, "metadata")?;
        let metadata = metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| StoreError::QueryFailed(format!("metadata column: {e}")))?;
        let created_at: String = col(row, "created_at")?;
        let updated_at: String = col(row, "updated_at")?;

        Ok(Tag {
            user_id: col(row, "user_id")?,
            key: col(row, "tag_key")?,
            value: col(row, "tag_value")?,
            metadata,
            created_at: parse_ts(&created_at, "created_at")?,
            updated_at: parse_ts(&updated_at, "updated_at")?,
        })
    }

    fn row_to_delivery(row: &SqliteRow) -> Result<DeliveryRecord, StoreError> {
        let subject: String = col(row, "subject")?;
        let subject = DeliverySubject::parse_key(&subject)
            .ok_or_else(|| StoreError::QueryFailed(format!("bad delivery subject '{subject}'")))?;
        let outcome: String = col(row, "outcome")?;
        let outcome = DeliveryOutcome::from_str(&outcome).map_err(StoreError::QueryFailed)?;
        let recorded_at: String = col(row, "recorded_at")?;

        Ok(DeliveryRecord {
            id: col(row, "id")?,
            subject,
            unit_key: col(row, "unit_key")?,
            outcome,
            detail: col(row, "detail")?,
            recorded_at: parse_ts(&recorded_at, "recorded_at")?,
        })
    }

    fn row_to_rule(row: &SqliteRow) -> Result<WorkflowRule, StoreError> {
        let trigger: String = col(row, "trigger_spec")?;
        let conditions: String = col(row, "conditions")?;
        let actions: String = col(row, "actions")?;

        Ok(WorkflowRule {
            id: col(row, "id")?,
            name: col(row, "name")?,
            trigger: RuleTrigger::from(trigger),
            conditions: serde_json::from_str(&conditions)
                .map_err(|e| StoreError::QueryFailed(format!("conditions column: {e}")))?,
            actions: serde_json::from_str(&actions)
                .map_err(|e| StoreError::QueryFailed(format!("actions column: {e}")))?,
            active: col(row, "active")?,
        })
    }

    fn row_to_sequence(row: &SqliteRow) -> Result<Sequence, StoreError> {
        let steps: String = col(row, "steps")?;

        Ok(Sequence {
            id: col(row, "id")?,
            name: col(row, "name")?,
            active: col(row, "active")?,
            trigger_tag: col(row, "trigger_tag")?,
            exit_tag: col(row, "exit_tag")?,
            steps: serde_json::from_str(&steps)
                .map_err(|e| StoreError::QueryFailed(format!("steps column: {e}")))?,
        })
    }

    /// Rows that fail to decode are logged and skipped so one corrupt row
    /// cannot hide every other rule or sequence.
    fn decode_all<T>(
        rows: &[SqliteRow],
        what: &str,
        decode: fn(&SqliteRow) -> Result<T, StoreError>,
    ) -> Vec<T> {
        rows.iter()
            .filter_map(|row| match decode(row) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable {what} row");
                    None
                }
            })
            .collect()
    }
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::QueryFailed(format!("{column} out of range: {value}")))
}

/// Fixed-width UTC timestamps so that string comparison in SQL is
/// chronological.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("{column} column: {e}")))
}

fn opt_ts(s: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_ts(&s, column)).transpose()
}

fn trigger_kind(trigger: &RuleTrigger) -> &'static str {
    match trigger {
        RuleTrigger::Event(_) => "event",
        RuleTrigger::Inactivity { .. } => "inactivity",
        RuleTrigger::Invalid(_) => "invalid",
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_active_enrollments_due_by(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.* FROM enrollments e
            JOIN sequences s ON s.id = e.sequence_id
            WHERE e.status = 'active'
              AND s.active = 1
              AND e.next_due_at <= ?1
              AND (e.lease_until IS NULL OR e.lease_until <= ?1)
            ORDER BY e.next_due_at ASC, e.id ASC
            LIMIT ?2
            "#,
        )
        .bind(ts(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Due enrollments: {e}")))?;

        rows.iter().map(Self::row_to_enrollment).collect()
    }

    async fn get_enrollment(&self, id: &str) -> Result<Option<Enrollment>, StoreError> {
        let row = sqlx::query("SELECT * FROM enrollments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET enrollment: {e}")))?;

        row.as_ref().map(Self::row_to_enrollment).transpose()
    }

    async fn find_active_enrollment(
        &self,
        user_id: &str,
        sequence_id: &str,
    ) -> Result<Option<Enrollment>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM enrollments WHERE user_id = ?1 AND sequence_id = ?2 AND status = 'active'",
        )
        .bind(user_id)
        .bind(sequence_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Active enrollment: {e}")))?;

        row.as_ref().map(Self::row_to_enrollment).transpose()
    }

    async fn list_enrollments_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM enrollments WHERE user_id = ?1 ORDER BY enrolled_at ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("User enrollments: {e}")))?;

        rows.iter().map(Self::row_to_enrollment).collect()
    }

    async fn create_enrollment(&self, new: NewEnrollment) -> Result<CreateOutcome, StoreError> {
        for _ in 0..CREATE_ATTEMPTS {
            let id = Uuid::new_v4().to_string();
            let result = sqlx::query(
                r#"
                INSERT INTO enrollments
                    (id, user_id, sequence_id, status, current_step, next_due_at,
                     steps_delivered, enrolled_at, needs_review)
                VALUES (?1, ?2, ?3, 'active', 0, ?4, 0, ?5, 0)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(&new.user_id)
            .bind(&new.sequence_id)
            .bind(ts(new.first_due_at))
            .bind(ts(new.enrolled_at))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("INSERT enrollment failed: {e}")))?;

            if result.rows_affected() == 1 {
                let created = self.get_enrollment(&id).await?.ok_or_else(|| {
                    StoreError::QueryFailed(format!("enrollment {id} vanished after insert"))
                })?;
                debug!(enrollment_id = %id, "Created enrollment");
                return Ok(CreateOutcome::Created(created));
            }

            if let Some(existing) = self
                .find_active_enrollment(&new.user_id, &new.sequence_id)
                .await?
            {
                return Ok(CreateOutcome::AlreadyExists(existing));
            }
        }

        Err(StoreError::Storage(format!(
            "could not create enrollment for ({}, {}) after {CREATE_ATTEMPTS} attempts",
            new.user_id, new.sequence_id
        )))
    }

    async fn try_claim_enrollment(
        &self,
        id: &str,
        expected_step: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments SET lease_until = ?1
            WHERE id = ?2 AND status = 'active' AND current_step = ?3
              AND (lease_until IS NULL OR lease_until <= ?4)
            "#,
        )
        .bind(ts(lease_until))
        .bind(id)
        .bind(i64::from(expected_step))
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Claim failed: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE enrollments SET lease_until = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Release failed: {e}")))?;
        Ok(())
    }

    async fn update_enrollment(
        &self,
        id: &str,
        expected_step: u32,
        update: EnrollmentUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        check_update(expected_step, &update)?;

        let result = sqlx::query(
            r#"
            UPDATE enrollments SET
                status = ?1,
                current_step = ?2,
                next_due_at = ?3,
                steps_delivered = ?4,
                completed_at = ?5,
                exited_at = ?6,
                exit_reason = ?7,
                needs_review = ?8,
                lease_until = NULL
            WHERE id = ?9 AND status = 'active' AND current_step = ?10
            "#,
        )
        .bind(update.status.as_str())
        .bind(i64::from(update.current_step))
        .bind(update.next_due_at.map(ts))
        .bind(i64::from(update.steps_delivered))
        .bind(update.completed_at.map(ts))
        .bind(update.exited_at.map(ts))
        .bind(&update.exit_reason)
        .bind(update.needs_review)
        .bind(id)
        .bind(i64::from(expected_step))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE enrollment failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Ok(UpdateOutcome::Conflict);
        }

        match self.get_enrollment(id).await? {
            Some(updated) => Ok(UpdateOutcome::Updated(updated)),
            None => Err(StoreError::QueryFailed(format!(
                "enrollment {id} vanished after update"
            ))),
        }
    }

    async fn count_enrollments(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM enrollments")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("COUNT: {e}")))?;

        let cnt: i64 = col(&row, "cnt")?;
        Ok(cnt as usize)
    }

    async fn get_tag_set(&self, user_id: &str) -> Result<TagSet, StoreError> {
        let rows = sqlx::query("SELECT tag_key, tag_value FROM tags WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Tag set: {e}")))?;

        rows.iter()
            .map(|row| -> Result<(String, Option<String>), StoreError> {
                Ok((col(row, "tag_key")?, col(row, "tag_value")?))
            })
            .collect()
    }

    async fn upsert_tag(
        &self,
        user_id: &str,
        key: &str,
        value: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Tag, StoreError> {
        let metadata = metadata
            .map(|m| serde_json::to_string(&m))
            .transpose()
            .map_err(|e| StoreError::Storage(format!("Metadata serialization: {e}")))?;
        let now = ts(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO tags (user_id, tag_key, tag_value, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(user_id, tag_key) DO UPDATE SET
                tag_value = excluded.tag_value,
                metadata = COALESCE(excluded.metadata, tags.metadata),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .bind(&metadata)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT tag failed: {e}")))?;

        let row = sqlx::query("SELECT * FROM tags WHERE user_id = ?1 AND tag_key = ?2")
            .bind(user_id)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET tag: {e}")))?;

        Self::row_to_tag(&row)
    }

    async fn remove_tag(&self, user_id: &str, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tags WHERE user_id = ?1 AND tag_key = ?2")
            .bind(user_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE tag failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_delivery(&self, new: NewDelivery) -> Result<RecordOutcome, StoreError> {
        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO deliveries (id, subject, unit_key, outcome, detail, recorded_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6
            WHERE ?4 != 'permanent_failure' OR NOT EXISTS (
                SELECT 1 FROM deliveries
                WHERE subject = ?2 AND unit_key = ?3 AND outcome = 'success'
            )
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(new.subject.key())
        .bind(&new.unit_key)
        .bind(new.outcome.as_str())
        .bind(&new.detail)
        .bind(ts(new.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT delivery failed: {e}")))?;

        if result.rows_affected() == 1 {
            return Ok(RecordOutcome::Recorded(DeliveryRecord {
                id,
                subject: new.subject,
                unit_key: new.unit_key,
                outcome: new.outcome,
                detail: new.detail,
                recorded_at: new.recorded_at,
            }));
        }

        match self
            .find_terminal_delivery(&new.subject, &new.unit_key)
            .await?
        {
            Some(existing) => Ok(RecordOutcome::AlreadyExists(existing)),
            None => Err(StoreError::Storage(format!(
                "delivery insert for {} / {} was ignored without a terminal record",
                new.subject, new.unit_key
            ))),
        }
    }

    async fn find_terminal_delivery(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM deliveries
            WHERE subject = ?1 AND unit_key = ?2 AND outcome != 'transient_failure'
            ORDER BY CASE outcome WHEN 'success' THEN 0 ELSE 1 END
            LIMIT 1
            "#,
        )
        .bind(subject.key())
        .bind(unit_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Terminal delivery: {e}")))?;

        row.as_ref().map(Self::row_to_delivery).transpose()
    }

    async fn try_claim_delivery(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_claims (subject, unit_key, lease_until) VALUES (?1, ?2, ?3)
            ON CONFLICT(subject, unit_key) DO UPDATE SET lease_until = excluded.lease_until
            WHERE delivery_claims.lease_until <= ?4
            "#,
        )
        .bind(subject.key())
        .bind(unit_key)
        .bind(ts(lease_until))
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Delivery claim failed: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_delivery_claim(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM delivery_claims WHERE subject = ?1 AND unit_key = ?2")
            .bind(subject.key())
            .bind(unit_key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Delivery claim release failed: {e}")))?;
        Ok(())
    }

    async fn list_deliveries(
        &self,
        subject: &DeliverySubject,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM deliveries WHERE subject = ?1 ORDER BY recorded_at ASC")
                .bind(subject.key())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("List deliveries: {e}")))?;

        rows.iter().map(Self::row_to_delivery).collect()
    }

    async fn find_rules_by_trigger(&self, trigger: &str) -> Result<Vec<WorkflowRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM rules
            WHERE active = 1 AND trigger_kind = 'event' AND trigger_spec = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(trigger)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Rules by trigger: {e}")))?;

        Ok(Self::decode_all(&rows, "rule", Self::row_to_rule))
    }

    async fn find_scheduled_rules(&self) -> Result<Vec<WorkflowRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM rules WHERE active = 1 AND trigger_kind = 'inactivity' ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Scheduled rules: {e}")))?;

        Ok(Self::decode_all(&rows, "rule", Self::row_to_rule))
    }

    async fn upsert_rule(&self, rule: WorkflowRule) -> Result<(), StoreError> {
        let conditions = serde_json::to_string(&rule.conditions)
            .map_err(|e| StoreError::Storage(format!("Conditions serialization: {e}")))?;
        let actions = serde_json::to_string(&rule.actions)
            .map_err(|e| StoreError::Storage(format!("Actions serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO rules (id, name, trigger_spec, trigger_kind, conditions, actions, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                trigger_spec = excluded.trigger_spec,
                trigger_kind = excluded.trigger_kind,
                conditions = excluded.conditions,
                actions = excluded.actions,
                active = excluded.active
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.trigger.to_string())
        .bind(trigger_kind(&rule.trigger))
        .bind(&conditions)
        .bind(&actions)
        .bind(rule.active)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT rule failed: {e}")))?;

        debug!(rule_id = %rule.id, "Stored rule");
        Ok(())
    }

    async fn set_rule_active(&self, rule_id: &str, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE rules SET active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Toggle rule failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_rules(&self) -> Result<Vec<WorkflowRule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("List rules: {e}")))?;

        Ok(Self::decode_all(&rows, "rule", Self::row_to_rule))
    }

    async fn upsert_sequence(&self, sequence: Sequence) -> Result<(), StoreError> {
        let steps = serde_json::to_string(&sequence.steps)
            .map_err(|e| StoreError::Storage(format!("Steps serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sequences (id, name, active, trigger_tag, exit_tag, steps)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                active = excluded.active,
                trigger_tag = excluded.trigger_tag,
                exit_tag = excluded.exit_tag,
                steps = excluded.steps
            "#,
        )
        .bind(&sequence.id)
        .bind(&sequence.name)
        .bind(sequence.active)
        .bind(&sequence.trigger_tag)
        .bind(&sequence.exit_tag)
        .bind(&steps)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT sequence failed: {e}")))?;

        debug!(sequence_id = %sequence.id, "Stored sequence");
        Ok(())
    }

    async fn get_sequence(&self, id: &str) -> Result<Option<Sequence>, StoreError> {
        let row = sqlx::query("SELECT * FROM sequences WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET sequence: {e}")))?;

        row.as_ref().map(Self::row_to_sequence).transpose()
    }

    async fn list_sequences(&self) -> Result<Vec<Sequence>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sequences ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("List sequences: {e}")))?;

        Ok(Self::decode_all(&rows, "sequence", Self::row_to_sequence))
    }

    async fn find_sequences_by_trigger_tag(
        &self,
        tag_key: &str,
    ) -> Result<Vec<Sequence>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sequences WHERE active = 1 AND trigger_tag = ?1 ORDER BY id ASC",
        )
        .bind(tag_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Sequences by trigger tag: {e}")))?;

        Ok(Self::decode_all(&rows, "sequence", Self::row_to_sequence))
    }

    async fn set_sequence_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sequences SET active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Toggle sequence failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_activity(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO activity (user_id, last_active_at) VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET
                last_active_at = MAX(activity.last_active_at, excluded.last_active_at)
            "#,
        )
        .bind(user_id)
        .bind(ts(at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Record activity failed: {e}")))?;
        Ok(())
    }

    async fn find_inactive_users(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, &str)>,
        limit: usize,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, last_active_at FROM activity
            WHERE last_active_at < ?1
              AND (?2 IS NULL OR last_active_at > ?2 OR (last_active_at = ?2 AND user_id > ?3))
            ORDER BY last_active_at ASC, user_id ASC
            LIMIT ?4
            "#,
        )
        .bind(ts(cutoff))
        .bind(after.map(|(at, _)| ts(at)))
        .bind(after.map(|(_, user)| user))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("Inactive users: {e}")))?;

        rows.iter()
            .map(|row| -> Result<(String, DateTime<Utc>), StoreError> {
                let at: String = col(row, "last_active_at")?;
                Ok((col(row, "user_id")?, parse_ts(&at, "last_active_at")?))
            })
            .collect()
    }
}
