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
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            receiver_id     INTEGER NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(receiver_id, is_read);

        CREATE TABLE IF NOT EXISTS unread_counts (
            user_id     INTEGER PRIMARY KEY REFERENCES users(id),
            count       INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
