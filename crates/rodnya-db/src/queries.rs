use crate::Database;
use crate::models::{MessageRow, NewMessage, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row};

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str, password_hash: &str, created_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password, created_at) VALUES (?1, ?2, ?3)",
                (username, password_hash, created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    /// All registered users ordered by username.
    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password, avatar_url, status_text, last_online, created_at
                 FROM users ORDER BY username",
            )?;
            let rows = stmt
                .query_map([], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_last_online(&self, username: &str, at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_online = ?1 WHERE username = ?2",
                (at, username),
            )?;
            Ok(())
        })
    }

    pub fn update_status_text(&self, username: &str, status_text: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET status_text = ?1 WHERE username = ?2",
                (status_text, username),
            )?;
            Ok(())
        })
    }

    pub fn update_avatar_url(&self, username: &str, avatar_url: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET avatar_url = ?1 WHERE username = ?2",
                (avatar_url, username),
            )?;
            Ok(())
        })
    }

    // -- Messages --

    /// Insert a message and return its assigned row id.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages
                    (from_user, to_user, message, filename, originalname, url,
                     mimetype, caption, type, is_general, read_status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
                rusqlite::params![
                    msg.from_user,
                    msg.to_user,
                    msg.message,
                    msg.filename,
                    msg.originalname,
                    msg.url,
                    msg.mimetype,
                    msg.caption,
                    msg.kind,
                    msg.is_general,
                    msg.created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_MESSAGE))?;
            let row = stmt.query_row([id], map_message).optional()?;
            Ok(row)
        })
    }

    /// Delete a message row; returns whether anything was removed.
    pub fn delete_message(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    /// Last `limit` general-chat messages, oldest first.
    pub fn general_history(&self, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE is_general = 1 ORDER BY created_at DESC, id DESC LIMIT ?1",
                SELECT_MESSAGE
            ))?;
            let mut rows = stmt
                .query_map([limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// Last `limit` messages of the private conversation between two users,
    /// oldest first.
    pub fn private_history(&self, a: &str, b: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE is_general = 0
                     AND ((from_user = ?1 AND to_user = ?2)
                       OR (from_user = ?2 AND to_user = ?1))
                 ORDER BY created_at DESC, id DESC LIMIT ?3",
                SELECT_MESSAGE
            ))?;
            let mut rows = stmt
                .query_map(rusqlite::params![a, b, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn set_read_status(&self, id: i64, read_status: u8) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET read_status = ?1 WHERE id = ?2",
                (read_status, id),
            )?;
            Ok(())
        })
    }

    /// Mark every private message from `from_user` to `to_user` as read.
    /// Returns the ids that changed state.
    pub fn mark_conversation_read(&self, from_user: &str, to_user: &str) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE from_user = ?1 AND to_user = ?2 AND is_general = 0 AND read_status < 2",
            )?;
            let ids = stmt
                .query_map((from_user, to_user), |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if !ids.is_empty() {
                conn.execute(
                    "UPDATE messages SET read_status = 2
                     WHERE from_user = ?1 AND to_user = ?2 AND is_general = 0 AND read_status < 2",
                    (from_user, to_user),
                )?;
            }
            Ok(ids)
        })
    }

    // -- Push subscriptions --

    pub fn upsert_push_subscription(&self, username: &str, subscription: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO push_subscriptions (username, subscription) VALUES (?1, ?2)
                 ON CONFLICT(username) DO UPDATE SET subscription = excluded.subscription",
                (username, subscription),
            )?;
            Ok(())
        })
    }

    pub fn get_push_subscription(&self, username: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let sub = conn
                .query_row(
                    "SELECT subscription FROM push_subscriptions WHERE username = ?1",
                    [username],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(sub)
        })
    }
}

const SELECT_MESSAGE: &str =
    "SELECT id, from_user, to_user, message, filename, originalname, url,
            mimetype, caption, type, is_general, read_status, created_at
     FROM messages";

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        avatar_url: row.get(3)?,
        status_text: row.get(4)?,
        last_online: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        from_user: row.get(1)?,
        to_user: row.get(2)?,
        message: row.get(3)?,
        filename: row.get(4)?,
        originalname: row.get(5)?,
        url: row.get(6)?,
        mimetype: row.get(7)?,
        caption: row.get(8)?,
        kind: row.get(9)?,
        is_general: row.get(10)?,
        read_status: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password, avatar_url, status_text, last_online, created_at
         FROM users WHERE username = ?1",
    )?;

    let row = stmt.query_row([username], map_user).optional()?;
    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
