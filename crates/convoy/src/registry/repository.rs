//! Session persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::models::{SessionMetadata, SessionStatus};

const SESSION_COLUMNS: &str = r#"
    session_id, user_id, auth_method, requested_phone, status, phone_number,
    error_message, created_at, last_activity_at
"#;

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: String,
    user_id: String,
    auth_method: String,
    requested_phone: Option<String>,
    status: SessionStatus,
    phone_number: Option<String>,
    error_message: Option<String>,
    created_at: String,
    last_activity_at: String,
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("parsing {} '{}'", column, value))
}

impl TryFrom<SessionRow> for SessionMetadata {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(SessionMetadata {
            auth_method: row
                .auth_method
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("session {}", row.session_id))?,
            created_at: parse_timestamp(&row.created_at, "created_at")?,
            last_activity_at: parse_timestamp(&row.last_activity_at, "last_activity_at")?,
            session_id: row.session_id,
            user_id: row.user_id,
            requested_phone: row.requested_phone,
            status: row.status,
            auth_data: None,
            phone_number: row.phone_number,
            error_message: row.error_message,
        })
    }
}

/// Write-through store for registry snapshots.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a session snapshot. `auth_data` is not stored.
    pub async fn upsert(&self, session: &SessionMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, auth_method, requested_phone, status, phone_number,
                error_message, created_at, last_activity_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                phone_number = excluded.phone_number,
                error_message = excluded.error_message,
                last_activity_at = excluded.last_activity_at
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(session.auth_method.as_str())
        .bind(&session.requested_phone)
        .bind(session.status)
        .bind(&session.phone_number)
        .bind(&session.error_message)
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_activity_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting session {}", session.session_id))?;

        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting session {}", session_id))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        let query = format!("SELECT {} FROM sessions WHERE session_id = ?", SESSION_COLUMNS);
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        row.map(SessionMetadata::try_from).transpose()
    }

    /// All persisted sessions, oldest first.
    pub async fn list(&self) -> Result<Vec<SessionMetadata>> {
        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at ASC",
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        rows.into_iter().map(SessionMetadata::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::driver::Challenge;
    use crate::registry::CreateSessionOptions;

    async fn repo() -> SessionRepository {
        let db = Database::in_memory().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn upsert_and_reload() {
        let repo = repo().await;
        let mut session = SessionMetadata::new(
            "s1".into(),
            "u2".into(),
            CreateSessionOptions::pairing_code("15550000"),
        );
        session.status = SessionStatus::AwaitingAuth;
        session.auth_data = Some(Challenge::pairing_code("ABCD-1234"));
        repo.upsert(&session).await.unwrap();

        let loaded = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u2");
        assert_eq!(loaded.status, SessionStatus::AwaitingAuth);
        assert_eq!(loaded.requested_phone.as_deref(), Some("15550000"));
        assert!(loaded.auth_data.is_none());

        session.status = SessionStatus::Ready;
        session.auth_data = None;
        session.phone_number = Some("15550000".into());
        repo.upsert(&session).await.unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SessionStatus::Ready);
        assert_eq!(all[0].phone_number.as_deref(), Some("15550000"));
    }

    #[tokio::test]
    async fn delete_missing_is_not_an_error() {
        let repo = repo().await;
        assert!(!repo.delete("nope").await.unwrap());
        assert!(repo.get("nope").await.unwrap().is_none());
    }
}
