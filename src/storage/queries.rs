//! Chat queries

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::{ChatcastError, Result};
use crate::types::{Chat, MAX_CHAT_LENGTH};

fn chat_from_row(row: &Row) -> rusqlite::Result<Chat> {
    let created_at: String = row.get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Chat {
        id: row.get("id")?,
        content: row.get("content")?,
        created_at,
    })
}

/// Validate and normalize chat content
pub fn normalize_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatcastError::InvalidInput(
            "chat message must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_CHAT_LENGTH {
        return Err(ChatcastError::InvalidInput(format!(
            "chat message exceeds {} characters",
            MAX_CHAT_LENGTH
        )));
    }
    Ok(trimmed.to_string())
}

/// Store a new chat message
pub fn create_chat(conn: &Connection, content: &str) -> Result<Chat> {
    let content = normalize_content(content)?;
    let now = Utc::now();

    conn.execute(
        "INSERT INTO chats (content, created_at) VALUES (?1, ?2)",
        params![content, now.to_rfc3339()],
    )?;

    Ok(Chat {
        id: conn.last_insert_rowid(),
        content,
        created_at: now,
    })
}

/// List all chats, oldest first
pub fn list_chats(conn: &Connection) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare("SELECT id, content, created_at FROM chats ORDER BY id ASC")?;
    let chats = stmt
        .query_map([], chat_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(chats)
}

/// Count stored chats
pub fn count_chats(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))?;
    Ok(count)
}
