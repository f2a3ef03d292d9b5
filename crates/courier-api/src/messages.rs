use anyhow::anyhow;
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::warn;

use courier_db::models::MessageRow;
use courier_types::api::{Claims, SendMessageRequest, UnreadCountResponse};
use courier_types::models::Message;

use crate::auth::AppState;
use crate::error::ApiError;

fn message_from_row(row: MessageRow) -> Message {
    let timestamp = row.created_at.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt created_at '{}' on message {}: {}", row.created_at, row.id, e);
        DateTime::default()
    });

    Message {
        id: row.id,
        sender: row.sender_id,
        receiver: row.receiver_id,
        content: row.content,
        timestamp,
        is_read: row.is_read,
    }
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    ApiError::Internal(anyhow!("spawn_blocking join error: {}", e))
}

/// Create the message and bump the receiver's unread counter in one
/// transaction (courier-db does both writes atomically).
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::Validation("Message content must not be empty.".into()));
    }

    // Run blocking DB work off the async runtime
    let db = state.clone();
    let sender = claims.sub;
    let row = tokio::task::spawn_blocking(move || -> Result<MessageRow, ApiError> {
        if db.db.get_user_by_id(req.receiver)?.is_none() {
            return Err(ApiError::Validation("Receiver does not exist.".into()));
        }
        Ok(db.db.send_message(sender, req.receiver, &req.content)?)
    })
    .await
    .map_err(join_error)??;

    Ok((StatusCode::CREATED, Json(message_from_row(row))))
}

/// Conversation between the requester and the other user, both directions,
/// ascending by timestamp. Read-only: counters are not touched.
pub async fn get_history(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let db = state.clone();
    let requester = claims.sub;
    let rows = tokio::task::spawn_blocking(move || -> Result<Vec<MessageRow>, ApiError> {
        if db.db.get_user_by_id(user_id)?.is_none() {
            return Err(ApiError::Validation("Other user does not exist.".into()));
        }
        Ok(db.db.message_history(requester, user_id)?)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(rows.into_iter().map(message_from_row).collect()))
}

/// Only the receiver may mark a message read. The flip and the counter
/// decrement happen in one transaction; marking an already-read message is
/// a no-op and never decrements twice.
pub async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Message>, ApiError> {
    let db = state.clone();
    let requester = claims.sub;
    let row = tokio::task::spawn_blocking(move || -> Result<MessageRow, ApiError> {
        let row = db.db.get_message(message_id)?.ok_or(ApiError::NotFound)?;

        // 404 before 403, so existence is checked first. A non-receiver can
        // therefore tell whether the id exists; accepted tradeoff.
        if row.receiver_id != requester {
            return Err(ApiError::PermissionDenied);
        }

        db.db.mark_message_read(message_id)?.ok_or(ApiError::NotFound)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(message_from_row(row)))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let db = state.clone();
    let user = claims.sub;
    let count = tokio::task::spawn_blocking(move || -> Result<i64, ApiError> {
        Ok(db.db.unread_count(user)?)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(UnreadCountResponse { count }))
}
