use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            avatar_url  TEXT,
            status_text TEXT,
            last_online TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Usernames are denormalized into messages; no foreign keys here.
        CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            from_user    TEXT NOT NULL,
            to_user      TEXT NOT NULL,
            message      TEXT,
            filename     TEXT,
            originalname TEXT,
            url          TEXT,
            mimetype     TEXT,
            caption      TEXT,
            type         TEXT NOT NULL DEFAULT 'text',
            is_general   INTEGER NOT NULL DEFAULT 0,
            read_status  INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_general
            ON messages(is_general, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(from_user, to_user, created_at);

        CREATE TABLE IF NOT EXISTS push_subscriptions (
            username     TEXT NOT NULL UNIQUE,
            subscription TEXT NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
