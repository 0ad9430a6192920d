//! Upserts and loads for [`MonetizeToken`] records.

use rusqlite::{params, Connection};

use duolog_shared::{MonetizeToken, UserId};

use crate::codec;
use crate::error::Result;

pub fn upsert_token(conn: &Connection, token: &MonetizeToken) -> Result<()> {
    conn.execute(
        "INSERT INTO monetize_tokens (token, user_id, created_at, expires_at, status, link)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(token) DO UPDATE SET status = excluded.status",
        params![
            token.token.to_string(),
            token.user_id.0,
            token.created_at.to_rfc3339(),
            token.expires_at.to_rfc3339(),
            token.status.as_str(),
            token.link,
        ],
    )?;
    Ok(())
}

/// Tokens still awaiting redemption.
pub fn load_pending_tokens(conn: &Connection) -> Result<Vec<MonetizeToken>> {
    let mut stmt = conn.prepare(
        "SELECT token, user_id, created_at, expires_at, status, link
         FROM monetize_tokens
         WHERE status = 'pending'
         ORDER BY created_at ASC",
    )?;

    let rows = stmt.query_map([], |row| {
        let token: String = row.get(0)?;
        let created: String = row.get(2)?;
        let expires: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(MonetizeToken {
            token: codec::parse(0, &token)?,
            user_id: UserId(row.get(1)?),
            created_at: codec::timestamp(2, &created)?,
            expires_at: codec::timestamp(3, &expires)?,
            status: codec::parse(4, &status)?,
            link: row.get(5)?,
        })
    })?;

    let mut tokens = Vec::new();
    for row in rows {
        tokens.push(row?);
    }
    Ok(tokens)
}
