use rusqlite::Connection;
use uuid::Uuid;

use parley_types::error::{MessagingError, MessagingResult};
use parley_types::models::{Role, User};

use super::OptionalExt;
use crate::clock::to_sql;
use crate::models::{USER_COLUMNS, UserRow, user_from_row};
use crate::{Database, classify};

pub struct NewUser<'a> {
    pub handle: &'a str,
    pub display_name: Option<&'a str>,
    pub password_hash: &'a str,
    pub role: Role,
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, new: NewUser<'_>) -> MessagingResult<User> {
        let now = self.now();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, handle, display_name, password, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    new.handle,
                    new.display_name,
                    new.password_hash,
                    new.role.as_str(),
                    to_sql(now),
                ],
            )?;
            query_user(conn, id)?.ok_or_else(|| MessagingError::UserNotFound(id).into())
        })
        .map_err(classify)
    }

    pub fn get_user_by_handle(&self, handle: &str) -> MessagingResult<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {}, password FROM users WHERE handle = ?1", USER_COLUMNS);
            conn.query_row(&sql, [handle], |row| {
                Ok(UserRow {
                    user: user_from_row(row)?,
                    password: row.get(8)?,
                })
            })
            .optional()
        })
        .map_err(classify)
    }

    pub fn get_user(&self, id: Uuid) -> MessagingResult<User> {
        self.with_conn(|conn| query_user(conn, id))
            .map_err(classify)?
            .ok_or(MessagingError::UserNotFound(id))
    }

    /// Directory listing for starting conversations, ordered by handle.
    pub fn list_users(&self, excluding: Option<Uuid>, role: Option<Role>) -> MessagingResult<Vec<User>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users
                 WHERE (?1 IS NULL OR id != ?1)
                   AND (?2 IS NULL OR role = ?2)
                 ORDER BY handle",
                USER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![excluding.map(|u| u.to_string()), role.map(|r| r.as_str())],
                    user_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .map_err(classify)
    }

    /// Record a presence change; `last_seen` moves on every transition.
    pub fn set_presence(&self, user_id: Uuid, online: bool) -> MessagingResult<()> {
        let now = self.now();
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET is_online = ?2, last_seen = ?3 WHERE id = ?1",
                rusqlite::params![user_id.to_string(), online, to_sql(now)],
            )?;
            if changed == 0 {
                return Err(MessagingError::UserNotFound(user_id).into());
            }
            Ok(())
        })
        .map_err(classify)
    }
}

pub(crate) fn query_user(conn: &Connection, id: Uuid) -> anyhow::Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    conn.query_row(&sql, [id.to_string()], user_from_row).optional()
}

pub(crate) fn user_exists(conn: &Connection, id: Uuid) -> anyhow::Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}
