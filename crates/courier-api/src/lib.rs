pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;

use axum::{
    Router,
    routing::{get, patch, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// Full REST router: public auth routes plus the protected message routes.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/messages/history/{user_id}", get(messages::get_history))
        .route("/messages/{message_id}/read", patch(messages::mark_message_read))
        .route("/messages/unread", get(messages::unread_count))
        .layer(axum::middleware::from_fn(require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
