//! Conversation persistence for the Solace pipeline.
//!
//! Conversations and users belong to the surrounding application; this
//! crate only covers the fields the pipeline itself reads or writes:
//! ownership lookups, turn messages (text, audio reference, token usage),
//! recent-context retrieval and terminal session records.
//!
//! Every function takes a plain `&Connection` and is blocking. Async callers
//! run them inside `tokio::task::spawn_blocking` with a pooled connection.

pub mod session;

use rusqlite::{params, Connection, OptionalExtension, Row};
use solace_types::{ContextTurn, PipelineMessage, Sender};
use thiserror::Error;

pub use session::{get_session_record, record_session, EndReason, SessionRecord};

/// Errors that can occur during conversation operations.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parameters for persisting a new turn.
#[derive(Debug, Clone)]
pub struct CreateMessageParams {
    pub conversation_id: String,
    pub message_id: String,
    pub sender: Sender,
    pub text: Option<String>,
    pub audio_ref: Option<String>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub metadata: serde_json::Value,
}

impl CreateMessageParams {
    /// A user turn with no artifacts yet.
    pub fn user(conversation_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            sender: Sender::User,
            text: None,
            audio_ref: None,
            tokens_in: None,
            tokens_out: None,
            metadata: serde_json::json!({}),
        }
    }
}

/// Registers a conversation for a user.
///
/// Conversations are normally created by the surrounding application; this
/// exists for provisioning and tests.
pub fn create_conversation(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<(), ConversationError> {
    conn.execute(
        "INSERT INTO conversations (conversation_id, user_id) VALUES (?1, ?2)",
        params![conversation_id, user_id],
    )?;
    Ok(())
}

/// Returns the owning user of a conversation, or `None` if it does not exist.
pub fn conversation_owner(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<String>, ConversationError> {
    let owner = conn
        .query_row(
            "SELECT user_id FROM conversations WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(owner)
}

/// Checks whether `user_id` may access `conversation_id`.
pub fn is_owner(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<bool, ConversationError> {
    Ok(conversation_owner(conn, conversation_id)?.as_deref() == Some(user_id))
}

const MESSAGE_COLUMNS: &str = "conversation_id, message_id, sender, text, audio_ref, \
                               tokens_in, tokens_out, metadata_json, created_at";

/// Inserts a new message and returns it.
pub fn create_message(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<PipelineMessage, ConversationError> {
    let metadata_json = serde_json::to_string(&params.metadata)?;
    let sql = format!(
        "INSERT INTO messages (
            conversation_id, message_id, sender, text, audio_ref,
            tokens_in, tokens_out, metadata_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING {MESSAGE_COLUMNS}"
    );
    let message = conn.query_row(
        &sql,
        params![
            params.conversation_id,
            params.message_id,
            params.sender.as_str(),
            params.text,
            params.audio_ref,
            params.tokens_in,
            params.tokens_out,
            metadata_json,
        ],
        map_row_to_message,
    )?;
    Ok(message)
}

/// Inserts a message unless one with the same id already exists, returning
/// whichever row is stored.
///
/// Retried jobs use deterministic message ids so a re-run converges on the
/// row written by the first attempt instead of duplicating it.
pub fn create_message_once(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<PipelineMessage, ConversationError> {
    let metadata_json = serde_json::to_string(&params.metadata)?;
    conn.execute(
        "INSERT OR IGNORE INTO messages (
            conversation_id, message_id, sender, text, audio_ref,
            tokens_in, tokens_out, metadata_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            params.conversation_id,
            params.message_id,
            params.sender.as_str(),
            params.text,
            params.audio_ref,
            params.tokens_in,
            params.tokens_out,
            metadata_json,
        ],
    )?;
    get_message(conn, &params.message_id)
}

/// Retrieves a message by its id.
pub fn get_message(conn: &Connection, message_id: &str) -> Result<PipelineMessage, ConversationError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1");
    conn.query_row(&sql, [message_id], map_row_to_message)
        .optional()?
        .ok_or_else(|| ConversationError::NotFound(message_id.to_string()))
}

/// Fills in the transcribed text of a message.
pub fn set_message_text(
    conn: &Connection,
    message_id: &str,
    text: &str,
) -> Result<(), ConversationError> {
    let updated = conn.execute(
        "UPDATE messages SET text = ?1 WHERE message_id = ?2",
        params![text, message_id],
    )?;
    if updated == 0 {
        return Err(ConversationError::NotFound(message_id.to_string()));
    }
    Ok(())
}

/// Attaches a synthesized audio reference to a message.
pub fn attach_audio(
    conn: &Connection,
    message_id: &str,
    audio_ref: &str,
) -> Result<(), ConversationError> {
    let updated = conn.execute(
        "UPDATE messages SET audio_ref = ?1 WHERE message_id = ?2",
        params![audio_ref, message_id],
    )?;
    if updated == 0 {
        return Err(ConversationError::NotFound(message_id.to_string()));
    }
    Ok(())
}

/// Lists the most recent messages of a conversation, oldest first.
pub fn list_messages(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
) -> Result<Vec<PipelineMessage>, ConversationError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM (
            SELECT id, {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = ?1
            ORDER BY id DESC
            LIMIT ?2
        ) ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![conversation_id, limit], map_row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Returns up to `limit` text turns written before `answering_message_id`
/// (the turn currently being answered), oldest first.
///
/// Turns stored after it, such as a later message that raced a queued
/// generation, never leak in. An unknown id bounds nothing and yields the
/// latest turns.
pub fn recent_context(
    conn: &Connection,
    conversation_id: &str,
    answering_message_id: &str,
    limit: u32,
) -> Result<Vec<ContextTurn>, ConversationError> {
    let mut stmt = conn.prepare(
        "SELECT sender, text FROM (
            SELECT id, sender, text FROM messages
            WHERE conversation_id = ?1 AND message_id != ?2
              AND id < COALESCE(
                  (SELECT id FROM messages WHERE message_id = ?2),
                  9223372036854775807
              )
              AND text IS NOT NULL AND text != ''
            ORDER BY id DESC
            LIMIT ?3
        ) ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id, answering_message_id, limit], |row| {
        let sender: String = row.get(0)?;
        Ok((sender, row.get::<_, String>(1)?))
    })?;

    let mut turns = Vec::new();
    for row in rows {
        let (sender, text) = row?;
        let sender = sender.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        turns.push(ContextTurn { sender, text });
    }
    Ok(turns)
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<PipelineMessage> {
    let sender: String = row.get(2)?;
    let sender = sender.parse::<Sender>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let metadata_json: String = row.get(7)?;
    let metadata = serde_json::from_str(&metadata_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PipelineMessage {
        conversation_id: row.get(0)?,
        message_id: row.get(1)?,
        sender,
        text: row.get(3)?,
        audio_ref: row.get(4)?,
        tokens_in: row.get(5)?,
        tokens_out: row.get(6)?,
        metadata,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use solace_db::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().expect("failed to open in-memory db");
        run_migrations(&conn).expect("failed to run migrations");
        create_conversation(&conn, "c1", "u1").expect("failed to create conversation");
        conn
    }

    fn text_turn(id: &str, sender: Sender, text: &str) -> CreateMessageParams {
        CreateMessageParams {
            sender,
            text: Some(text.to_string()),
            ..CreateMessageParams::user("c1", id)
        }
    }

    #[test]
    fn ownership_is_checked_per_user() {
        let conn = setup_db();
        assert!(is_owner(&conn, "c1", "u1").unwrap());
        assert!(!is_owner(&conn, "c1", "intruder").unwrap());
        assert!(!is_owner(&conn, "missing", "u1").unwrap());
    }

    #[test]
    fn message_is_mutated_additively() {
        let conn = setup_db();
        let created = create_message(&conn, &CreateMessageParams::user("c1", "m1")).unwrap();
        assert_eq!(created.sender, Sender::User);
        assert!(created.text.is_none());

        set_message_text(&conn, "m1", "Estou ansiosa").unwrap();
        attach_audio(&conn, "m1", "audio/m1.pcm").unwrap();

        let stored = get_message(&conn, "m1").unwrap();
        assert_eq!(stored.text.as_deref(), Some("Estou ansiosa"));
        assert_eq!(stored.audio_ref.as_deref(), Some("audio/m1.pcm"));
    }

    #[test]
    fn updating_a_missing_message_is_not_found() {
        let conn = setup_db();
        assert!(matches!(
            attach_audio(&conn, "nope", "audio/x.pcm"),
            Err(ConversationError::NotFound(_))
        ));
    }

    #[test]
    fn create_message_once_keeps_the_first_row() {
        let conn = setup_db();
        let first = create_message_once(&conn, &text_turn("r1", Sender::System, "first")).unwrap();
        let second =
            create_message_once(&conn, &text_turn("r1", Sender::System, "second")).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.text.as_deref(), Some("first"));
        assert_eq!(list_messages(&conn, "c1", 10).unwrap().len(), 1);
    }

    #[test]
    fn recent_context_is_bounded_and_chronological() {
        let conn = setup_db();
        for i in 0..5 {
            let sender = if i % 2 == 0 { Sender::User } else { Sender::System };
            create_message(&conn, &text_turn(&format!("m{i}"), sender, &format!("turn {i}")))
                .unwrap();
        }
        create_message(&conn, &CreateMessageParams::user("c1", "audio-only")).unwrap();

        let turns = recent_context(&conn, "c1", "m4", 3).unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 1", "turn 2", "turn 3"]);
        assert_eq!(turns[0].sender, Sender::System);
    }

    #[test]
    fn recent_context_ignores_turns_written_after_the_answered_one() {
        let conn = setup_db();
        create_message(&conn, &text_turn("m1", Sender::User, "oi")).unwrap();
        create_message(&conn, &text_turn("m2", Sender::System, "olá")).unwrap();
        create_message(&conn, &text_turn("m3", Sender::User, "estou cansada")).unwrap();
        create_message(&conn, &text_turn("m4", Sender::User, "e com fome")).unwrap();

        let turns = recent_context(&conn, "c1", "m3", 10).unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["oi", "olá"]);

        let unknown = recent_context(&conn, "c1", "never-stored", 2).unwrap();
        let texts: Vec<&str> = unknown.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["estou cansada", "e com fome"]);
    }
}
