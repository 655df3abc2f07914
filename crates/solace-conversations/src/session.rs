//! Terminal records of real-time sessions.

use crate::ConversationError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use solace_types::SessionState;

/// Why a live session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The client sent `end`.
    Client,
    /// The connection dropped while the session was active.
    Disconnect,
    /// The server shut down.
    Shutdown,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Disconnect => "disconnect",
            Self::Shutdown => "shutdown",
        }
    }
}

/// The persisted final state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub state: SessionState,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub chunks_processed: u32,
    pub end_reason: String,
}

/// Writes the terminal record of a session. Writing the same session twice
/// keeps the first record.
pub fn record_session(conn: &Connection, record: &SessionRecord) -> Result<(), ConversationError> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions (
            session_id, user_id, conversation_id, state, started_at, ended_at,
            duration_ms, chunks_processed, end_reason
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.session_id,
            record.user_id,
            record.conversation_id,
            record.state.as_str(),
            record.started_at,
            record.ended_at,
            record.duration_ms as i64,
            record.chunks_processed,
            record.end_reason,
        ],
    )?;
    Ok(())
}

pub fn get_session_record(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionRecord>, ConversationError> {
    let record = conn
        .query_row(
            "SELECT session_id, user_id, conversation_id, started_at, ended_at,
                    duration_ms, chunks_processed, end_reason
             FROM sessions WHERE session_id = ?1",
            [session_id],
            |row| {
                Ok(SessionRecord {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    conversation_id: row.get(2)?,
                    state: SessionState::Ended,
                    started_at: row.get(3)?,
                    ended_at: row.get(4)?,
                    duration_ms: row.get::<_, i64>(5)?.max(0) as u64,
                    chunks_processed: row.get(6)?,
                    end_reason: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solace_db::run_migrations;

    #[test]
    fn session_record_is_written_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let mut record = SessionRecord {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            conversation_id: "c1".to_string(),
            state: SessionState::Ended,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ended_at: "2026-01-01T00:00:05Z".to_string(),
            duration_ms: 5_000,
            chunks_processed: 3,
            end_reason: EndReason::Disconnect.as_str().to_string(),
        };
        record_session(&conn, &record).unwrap();

        record.chunks_processed = 99;
        record_session(&conn, &record).unwrap();

        let stored = get_session_record(&conn, "s1").unwrap().expect("record exists");
        assert_eq!(stored.chunks_processed, 3);
        assert_eq!(stored.end_reason, "disconnect");
        assert!(get_session_record(&conn, "s2").unwrap().is_none());
    }
}
