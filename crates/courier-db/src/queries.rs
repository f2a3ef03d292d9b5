use crate::Database;
use crate::models::{MessageRow, UserRow};
use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password) VALUES (?1, ?2)",
                (username, password_hash),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    // -- Messages --

    /// Persist a new unread message and bump the receiver's unread counter.
    /// Both writes happen in one transaction; neither survives without the
    /// other.
    pub fn send_message(&self, sender_id: i64, receiver_id: i64, content: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
            tx.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![sender_id, receiver_id, content, created_at],
            )?;
            let id = tx.last_insert_rowid();

            increment_unread(&tx, receiver_id)?;

            let row = query_message(&tx, id)?
                .ok_or_else(|| anyhow!("Message {} missing after insert", id))?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// All messages between the two users, either direction, oldest first.
    /// Equal timestamps fall back to insertion order via the rowid.
    pub fn message_history(&self, user_a: i64, user_b: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, created_at, is_read
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt
                .query_map([user_a, user_b], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Flip a message to read and decrement the receiver's unread counter.
    /// Already-read messages are left untouched and the counter does not
    /// move again. Returns `None` when the message does not exist.
    pub fn mark_message_read(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let changed = tx.execute(
                "UPDATE messages SET is_read = 1 WHERE id = ?1 AND is_read = 0",
                [id],
            )?;

            let row = query_message(&tx, id)?;
            if changed > 0 {
                if let Some(row) = &row {
                    decrement_unread(&tx, row.receiver_id)?;
                }
            }

            tx.commit()?;
            Ok(row)
        })
    }

    // -- Unread counters --

    pub fn unread_count(&self, user_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM unread_counts WHERE user_id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }
}

/// Atomic upsert: create the counter row at 0 if absent, then add 1.
/// Single statement, so concurrent callers cannot lose updates.
pub fn increment_unread(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO unread_counts (user_id, count) VALUES (?1, 1)
         ON CONFLICT(user_id) DO UPDATE SET count = count + 1",
        [user_id],
    )?;
    Ok(())
}

/// Atomic upsert: create the counter row at 0 if absent, then subtract 1
/// floored at zero. The counter never goes negative.
pub fn decrement_unread(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO unread_counts (user_id, count) VALUES (?1, 0)
         ON CONFLICT(user_id) DO UPDATE SET count = MAX(0, count - 1)",
        [user_id],
    )?;
    Ok(())
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_message(conn: &Connection, id: i64) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, receiver_id, content, created_at, is_read
         FROM messages WHERE id = ?1",
    )?;

    let row = stmt.query_row([id], message_from_row).optional()?;

    Ok(row)
}

fn message_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        is_read: row.get(5)?,
    })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "hash-a").unwrap();
        let bob = db.create_user("bob", "hash-b").unwrap();
        (db, alice, bob)
    }

    /// True unread count straight from the messages table, for checking the
    /// derived counter against it.
    fn actual_unread(db: &Database, user: i64) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user],
                |row| row.get(0),
            )?)
        })
        .unwrap()
    }

    #[test]
    fn send_increments_unread_count() {
        let (db, alice, bob) = test_db();

        let msg = db.send_message(alice, bob, "Hello, this is a test message.").unwrap();
        assert_eq!(msg.sender_id, alice);
        assert_eq!(msg.receiver_id, bob);
        assert!(!msg.is_read);

        assert_eq!(db.unread_count(bob).unwrap(), 1);
        assert_eq!(db.unread_count(alice).unwrap(), 0);

        db.send_message(alice, bob, "Second message").unwrap();
        assert_eq!(db.unread_count(bob).unwrap(), 2);
    }

    #[test]
    fn mark_read_flips_and_decrements_once() {
        let (db, alice, bob) = test_db();
        let msg = db.send_message(alice, bob, "Check read status").unwrap();
        assert_eq!(db.unread_count(bob).unwrap(), 1);

        let updated = db.mark_message_read(msg.id).unwrap().unwrap();
        assert!(updated.is_read);
        assert_eq!(db.unread_count(bob).unwrap(), 0);

        // Second call is a no-op: no double decrement
        let again = db.mark_message_read(msg.id).unwrap().unwrap();
        assert!(again.is_read);
        assert_eq!(db.unread_count(bob).unwrap(), 0);
    }

    #[test]
    fn mark_read_missing_message_is_none() {
        let (db, _alice, _bob) = test_db();
        assert!(db.mark_message_read(9999).unwrap().is_none());
    }

    #[test]
    fn counter_never_goes_negative() {
        let (db, _alice, bob) = test_db();

        db.with_conn(|conn| {
            decrement_unread(conn, bob)?;
            decrement_unread(conn, bob)?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.unread_count(bob).unwrap(), 0);
    }

    #[test]
    fn unread_count_defaults_to_zero_without_row() {
        let (db, alice, _bob) = test_db();
        assert_eq!(db.unread_count(alice).unwrap(), 0);
    }

    #[test]
    fn history_is_ordered_both_directions() {
        let (db, alice, bob) = test_db();

        let m1 = db.send_message(alice, bob, "first").unwrap();
        let m2 = db.send_message(bob, alice, "second").unwrap();
        let m3 = db.send_message(alice, bob, "third").unwrap();

        let history = db.message_history(alice, bob).unwrap();
        let ids: Vec<i64> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m2.id, m3.id]);

        // Same result when queried from the other side
        let mirrored = db.message_history(bob, alice).unwrap();
        let mirrored_ids: Vec<i64> = mirrored.iter().map(|m| m.id).collect();
        assert_eq!(mirrored_ids, ids);
    }

    #[test]
    fn history_ties_break_by_insertion_order() {
        let (db, alice, bob) = test_db();

        // Insert directly with identical timestamps to force the tie
        db.with_conn(|conn| {
            for content in ["a", "b", "c"] {
                conn.execute(
                    "INSERT INTO messages (sender_id, receiver_id, content, created_at)
                     VALUES (?1, ?2, ?3, '2026-01-01T00:00:00.000000Z')",
                    rusqlite::params![alice, bob, content],
                )?;
            }
            Ok(())
        })
        .unwrap();

        let history = db.message_history(alice, bob).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn history_excludes_other_conversations() {
        let (db, alice, bob) = test_db();
        let carol = db.create_user("carol", "hash-c").unwrap();

        db.send_message(alice, bob, "for bob").unwrap();
        db.send_message(alice, carol, "for carol").unwrap();

        let history = db.message_history(alice, bob).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "for bob");
    }

    #[test]
    fn counter_matches_true_count_after_mixed_workload() {
        let (db, alice, bob) = test_db();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(db.send_message(alice, bob, &format!("msg {}", i)).unwrap().id);
        }
        db.send_message(bob, alice, "reply").unwrap();

        db.mark_message_read(ids[0]).unwrap();
        db.mark_message_read(ids[3]).unwrap();
        db.mark_message_read(ids[3]).unwrap(); // repeat on purpose

        assert_eq!(db.unread_count(bob).unwrap(), actual_unread(&db, bob));
        assert_eq!(db.unread_count(bob).unwrap(), 3);
        assert_eq!(db.unread_count(alice).unwrap(), actual_unread(&db, alice));
        assert_eq!(db.unread_count(alice).unwrap(), 1);
    }
}
