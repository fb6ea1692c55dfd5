//! SQLite journal of what the agent did.
//!
//! Append-only. The agent writes through a [`SessionLog`], which logs failures
//! instead of returning them so a broken journal never stops the exploration.

use chrono::{DateTime, Utc};
use probe_core::events::{EventPayload, JournalEvent};
use probe_core::Id;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Clone)]
pub struct Journal {
    pool: Pool<Sqlite>,
}

impl Journal {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Open and bring the schema up to date.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let journal = Self::new(db_path).await?;
        journal.migrate_embedded().await?;
        Ok(journal)
    }

    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    if !e.to_string().contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn append(&self, session_id: &Id, payload: &EventPayload) -> Result<JournalEvent> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, session_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(session_id.as_ref())
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(JournalEvent {
            id,
            session_id: session_id.clone(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// Events of one session in insertion order.
    pub async fn list_events(&self, session_id: &Id) -> Result<Vec<JournalEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, session_id, type, ts, payload_json FROM events \
             WHERE session_id = ?1 ORDER BY ts ASC, rowid ASC",
        )
        .bind(session_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Distinct sessions, oldest first.
    pub async fn list_sessions(&self) -> Result<Vec<Id>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT session_id FROM events GROUP BY session_id ORDER BY MIN(rowid) ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| Id::from_string(id)).collect())
    }
}

/// Journal handle for one connection session.
///
/// Appends are best effort: failures are logged and swallowed.
#[derive(Debug, Clone)]
pub struct SessionLog {
    journal: Option<Journal>,
    session_id: Id,
}

impl SessionLog {
    /// Start a new session; `None` disables journaling.
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            journal,
            session_id: Id::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn session_id(&self) -> &Id {
        &self.session_id
    }

    pub async fn record(&self, payload: EventPayload) {
        let Some(journal) = self.journal.as_ref() else {
            return;
        };
        match journal.append(&self.session_id, &payload).await {
            Ok(event) => debug!(event_type = %event.event_type, "journaled"),
            Err(err) => warn!(
                event_type = payload.event_type().as_str(),
                error = %err,
                "journal append failed"
            ),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    session_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> JournalEvent {
        JournalEvent {
            id: Id::from_string(self.id),
            session_id: Id::from_string(self.session_id),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::events::{CommandSentPayload, SessionStartedPayload, TaskStuckPayload};
    use tempfile::TempDir;

    async fn create_test_journal() -> (TempDir, Journal) {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(&dir.path().join("journal.db")).await.unwrap();
        (dir, journal)
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_dir, journal) = create_test_journal().await;
        journal.migrate_embedded().await.unwrap();
    }

    #[tokio::test]
    async fn append_and_list_in_order() {
        let (_dir, journal) = create_test_journal().await;
        let session = Id::new();
        let other = Id::new();

        journal
            .append(
                &session,
                &EventPayload::SessionStarted(SessionStartedPayload {
                    target: "127.0.0.1:4000".to_string(),
                    phase: 1,
                    phase_name: "Environment identification".to_string(),
                }),
            )
            .await
            .unwrap();
        journal
            .append(
                &other,
                &EventPayload::TaskStuck(TaskStuckPayload {
                    phase: 1,
                    task_id: "P1-T2".to_string(),
                    reason: "silent".to_string(),
                }),
            )
            .await
            .unwrap();
        journal
            .append(
                &session,
                &EventPayload::CommandSent(CommandSentPayload {
                    phase: 1,
                    task_id: Some("P1-T1".to_string()),
                    payload: "look".to_string(),
                }),
            )
            .await
            .unwrap();

        let events = journal.list_events(&session).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["SESSION_STARTED", "COMMAND_SENT"]);
        assert!(events[1].payload_json.contains("\"look\""));

        let sessions = journal.list_sessions().await.unwrap();
        assert_eq!(sessions, vec![session, other]);
    }

    #[tokio::test]
    async fn session_log_records_under_its_session() {
        let (_dir, journal) = create_test_journal().await;
        let log = SessionLog::new(Some(journal.clone()));
        log.record(EventPayload::CommandSent(CommandSentPayload {
            phase: 1,
            task_id: None,
            payload: "look".to_string(),
        }))
        .await;

        let events = journal.list_events(log.session_id()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "COMMAND_SENT");
    }

    #[tokio::test]
    async fn disabled_session_log_is_a_no_op() {
        SessionLog::disabled()
            .record(EventPayload::CommandSent(CommandSentPayload {
                phase: 1,
                task_id: None,
                payload: "look".to_string(),
            }))
            .await;
    }
}
