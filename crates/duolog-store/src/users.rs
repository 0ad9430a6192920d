//! Upserts and loads for [`UserProfile`] records.

use std::collections::{BTreeSet, HashMap};

use rusqlite::{params, Connection};

use duolog_shared::{AnonId, MonetizeState, UserId, UserProfile};

use crate::codec;
use crate::error::Result;

// ------------------------------------------------------------------
// Write
// ------------------------------------------------------------------

/// Insert or update a profile, replacing its block list.
pub fn upsert_user(conn: &Connection, user: &UserProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO users (user_id, anon_id, gender, preference, allow_files, is_banned,
                            warning_count, monetize_enabled, last_completed_at, next_due_at,
                            created_at, last_active_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(user_id) DO UPDATE SET
             gender = excluded.gender,
             preference = excluded.preference,
             allow_files = excluded.allow_files,
             is_banned = excluded.is_banned,
             warning_count = excluded.warning_count,
             monetize_enabled = excluded.monetize_enabled,
             last_completed_at = excluded.last_completed_at,
             next_due_at = excluded.next_due_at,
             last_active_at = excluded.last_active_at",
        params![
            user.user_id.0,
            user.anon_id.as_str(),
            user.gender.as_str(),
            user.preference.as_str(),
            user.allow_files,
            user.is_banned,
            user.warning_count,
            user.monetize.enabled,
            user.monetize.last_completed_at.map(|t| t.to_rfc3339()),
            user.monetize.next_due_at.map(|t| t.to_rfc3339()),
            user.created_at.to_rfc3339(),
            user.last_active_at.to_rfc3339(),
        ],
    )?;

    conn.execute(
        "DELETE FROM blocked_anon_ids WHERE user_id = ?1",
        params![user.user_id.0],
    )?;
    let mut stmt =
        conn.prepare_cached("INSERT INTO blocked_anon_ids (user_id, anon_id) VALUES (?1, ?2)")?;
    for anon_id in &user.blocked_anon_ids {
        stmt.execute(params![user.user_id.0, anon_id.as_str()])?;
    }

    Ok(())
}

// ------------------------------------------------------------------
// Read
// ------------------------------------------------------------------

/// Load every profile together with its block list.
pub fn load_users(conn: &Connection) -> Result<Vec<UserProfile>> {
    let mut blocked: HashMap<i64, BTreeSet<AnonId>> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT user_id, anon_id FROM blocked_anon_ids")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (user_id, anon_id) = row?;
            blocked.entry(user_id).or_default().insert(AnonId::new(anon_id));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT user_id, anon_id, gender, preference, allow_files, is_banned, warning_count,
                monetize_enabled, last_completed_at, next_due_at, created_at, last_active_at
         FROM users
         ORDER BY user_id ASC",
    )?;
    let rows = stmt.query_map([], row_to_user)?;

    let mut users = Vec::new();
    for row in rows {
        let mut user = row?;
        if let Some(set) = blocked.remove(&user.user_id.0) {
            user.blocked_anon_ids = set;
        }
        users.push(user);
    }
    Ok(users)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`UserProfile`] with an empty block list.
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let anon_id: String = row.get(1)?;
    let gender: String = row.get(2)?;
    let preference: String = row.get(3)?;
    let last_completed: Option<String> = row.get(8)?;
    let next_due: Option<String> = row.get(9)?;
    let created: String = row.get(10)?;
    let last_active: String = row.get(11)?;

    Ok(UserProfile {
        user_id: UserId(row.get(0)?),
        anon_id: AnonId::new(anon_id),
        gender: codec::parse(2, &gender)?,
        preference: codec::parse(3, &preference)?,
        allow_files: row.get(4)?,
        is_banned: row.get(5)?,
        warning_count: row.get(6)?,
        monetize: MonetizeState {
            enabled: row.get(7)?,
            last_completed_at: codec::opt_timestamp(8, last_completed)?,
            next_due_at: codec::opt_timestamp(9, next_due)?,
        },
        blocked_anon_ids: BTreeSet::new(),
        created_at: codec::timestamp(10, &created)?,
        last_active_at: codec::timestamp(11, &last_active)?,
    })
}
