//! Upserts and loads for [`Session`] records.

use rusqlite::{params, Connection};

use duolog_shared::{AnonId, Participant, Session, SessionId, UserId};

use crate::codec;
use crate::error::Result;

/// Insert or update a session row.
pub fn upsert_session(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (session_id, a_user_id, a_anon_id, b_user_id, b_anon_id,
                               started_at, status, end_reason, ended_at, ended_by,
                               message_count, last_activity_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(session_id) DO UPDATE SET
             status = excluded.status,
             end_reason = excluded.end_reason,
             ended_at = excluded.ended_at,
             ended_by = excluded.ended_by,
             message_count = excluded.message_count,
             last_activity_at = excluded.last_activity_at",
        params![
            session.session_id.as_str(),
            session.participant_a.user_id.0,
            session.participant_a.anon_id.as_str(),
            session.participant_b.user_id.0,
            session.participant_b.anon_id.as_str(),
            session.started_at.to_rfc3339(),
            session.status.as_str(),
            session.end_reason.map(|r| r.as_str()),
            session.ended_at.map(|t| t.to_rfc3339()),
            session.ended_by.map(|u| u.0),
            session.message_count as i64,
            session.last_activity_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Load sessions still in the `active` state, oldest first.
pub fn load_active_sessions(conn: &Connection) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, a_user_id, a_anon_id, b_user_id, b_anon_id, started_at, status,
                end_reason, ended_at, ended_by, message_count, last_activity_at
         FROM sessions
         WHERE status = 'active'
         ORDER BY started_at ASC",
    )?;

    let rows = stmt.query_map([], row_to_session)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }
    Ok(sessions)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let session_id: String = row.get(0)?;
    let a_anon: String = row.get(2)?;
    let b_anon: String = row.get(4)?;
    let started: String = row.get(5)?;
    let status: String = row.get(6)?;
    let end_reason: Option<String> = row.get(7)?;
    let ended_at: Option<String> = row.get(8)?;
    let ended_by: Option<i64> = row.get(9)?;
    let message_count: i64 = row.get(10)?;
    let last_activity: String = row.get(11)?;

    Ok(Session {
        session_id: SessionId::new(session_id),
        participant_a: Participant {
            user_id: UserId(row.get(1)?),
            anon_id: AnonId::new(a_anon),
        },
        participant_b: Participant {
            user_id: UserId(row.get(3)?),
            anon_id: AnonId::new(b_anon),
        },
        started_at: codec::timestamp(5, &started)?,
        status: codec::parse(6, &status)?,
        end_reason: end_reason.map(|r| codec::parse(7, &r)).transpose()?,
        ended_at: codec::opt_timestamp(8, ended_at)?,
        ended_by: ended_by.map(UserId),
        message_count: message_count.max(0) as u64,
        last_activity_at: codec::timestamp(11, &last_activity)?,
    })
}
