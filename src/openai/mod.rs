//! OpenAI API compatible service module
//!
//! Provides HTTP endpoints compatible with the OpenAI Chat Completions and
//! Responses APIs, translating both into the same Kiro upstream request
//! shape the Anthropic dialect produces.
//!
//! # Supported endpoints
//! - `POST /v1/chat/completions`
//! - `POST /v1/responses`

mod converter;
mod handlers;
mod responses_converter;
mod responses_handlers;
mod router;
mod stream;
pub mod types;

pub use router::create_router_with_state;
