//! Gemini-compatible API routing configuration

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::post,
};

use crate::anthropic::{AppState, auth_middleware, cors_layer};

use super::handlers::generate_content;

const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Builds the Gemini-compatible router. The inbound path embeds a literal
/// colon inside the final segment (`{model}:generateContent`), which
/// axum/matchit cannot express as a combined static+param single-segment
/// pattern, so the whole segment is captured here and split on `:` inside
/// the handler.
pub fn create_router_with_state(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/models/{model_action}", post(generate_content))
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
