use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A direct message between two users. `is_read` starts false and flips to
/// true exactly once, when the receiver marks the message read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender: i64,
    pub receiver: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}
