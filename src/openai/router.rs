//! OpenAI-compatible API routing configuration

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::post,
};

use crate::anthropic::{AppState, auth_middleware, cors_layer};

use super::handlers::post_chat_completions;
use super::responses_handlers::post_responses;

const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Builds the OpenAI-compatible router (`/v1/chat/completions`,
/// `/v1/responses`) from shared application state. `GET /v1/models` is
/// already served by the Anthropic dialect's router and is not duplicated
/// here.
pub fn create_router_with_state(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/chat/completions", post(post_chat_completions))
        .route("/responses", post(post_responses))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/v1", v1_routes)
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
